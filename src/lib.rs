pub mod api;
pub mod database_ops;
pub mod tracing;

pub mod util {
    pub mod clock;
    pub mod env;
}
