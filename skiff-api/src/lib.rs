//! Skiff gRPC API
//!
//! This crate defines the gRPC protocol for skiffd ↔ CLI communication.
//! The protobuf definitions are in `proto/skiff.proto` and code-generated via
//! `tonic-build`.

// Include the generated code
pub mod skiff {
    pub mod v1 {
        tonic::include_proto!("skiff.v1");
    }
}
