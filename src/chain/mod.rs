pub mod api;
pub mod mock_service;
pub mod types;


pub use api::ChainService;
pub use mock_service::MockChainService;
pub use types::{BlockStamp, FilterType, QueryOptions};
