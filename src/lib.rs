pub mod blobstore;
pub mod client;
pub mod config;
pub mod error;
pub mod grpc;
pub mod inspect;
pub mod scheduler;
pub mod shuffle;
pub mod shutdown;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("mapreduce");
}
