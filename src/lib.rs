pub mod classify;
pub mod fetch;
pub mod filter;
pub mod json;
pub mod parser;
pub mod schema;
pub mod server;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
