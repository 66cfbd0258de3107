pub mod clock;
pub mod http_client;

pub use clock::{Clock, MockClock, SystemClock};
pub use http_client::{ForwardRequest, ForwardResponse, HttpClient, HttpClientError, HttpClientResult};
