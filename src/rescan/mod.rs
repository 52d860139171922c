pub mod api;
pub mod mock_rescanner;
pub mod types;


pub use api::{RescanError, RescanFactory, Rescanner};
pub use mock_rescanner::{MockRescanFactory, MockRescanner, RescanRecord};
pub use types::{QuitHandle, QuitSignal, RescanOptions, RescanUpdate, WatchedInput};
