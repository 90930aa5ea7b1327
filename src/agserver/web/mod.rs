pub mod handlers;
pub mod server;

pub use handlers::AppState;
pub use server::start_web_server;
