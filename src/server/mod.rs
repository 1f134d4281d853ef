mod http;

pub use http::{run, AppState};
