pub mod routes;
pub mod state;
