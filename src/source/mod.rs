// Transport backends: the content-delivery network and local directory stores.

pub mod decoder;
pub mod http_source;
pub mod local_store;
pub mod traits;
