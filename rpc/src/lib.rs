extern crate bytes;
extern crate prost;
extern crate serde;
extern crate serde_json;
extern crate tonic;

#[allow(dead_code)]
#[allow(clippy::type_complexity)]
#[allow(clippy::unit_arg)]
#[allow(clippy::redundant_closure)]
pub mod gateway {
    include!(concat!(env!("OUT_DIR"), "/gateway.rs"));
}

#[allow(dead_code)]
pub mod monitor {
    include!(concat!(env!("OUT_DIR"), "/monitor.rs"));
}
