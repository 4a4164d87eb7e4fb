pub mod container;
pub mod fused;
pub mod loopdev;
pub mod master;
pub mod mounts;
pub mod namespaces;
pub mod rpc;
