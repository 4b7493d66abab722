pub mod cbor;
pub mod primary;
pub mod sdnv;
