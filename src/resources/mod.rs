//! Scene resources: meshes, materials, textures and their GPU encoding

pub mod encoder;
pub mod material;
pub mod mesh;
pub mod texture;

pub use encoder::MaterialEncoder;
pub use material::{MaterialDescriptor, MaterialRecord};
pub use mesh::{Aabb, IndexData, MeshData, PackedVertex, TriangleAttributes, VertexLayout};
pub use texture::{TextureData, TextureRecord};
