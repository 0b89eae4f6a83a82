pub mod balancer;
pub mod conversation;
pub mod encoder;
pub mod schema;
pub mod wire;
