//! CARv1 (Content Addressable aRchive) import and export
//!
//! Archives are the wire form for whole repositories, block subsets, and
//! firehose event payloads: a varint-length-prefixed DAG-CBOR header
//! `{"roots": [...], "version": 1}` followed by `varint(36 + len(block))
//! ‖ cid ‖ block` sections.

pub mod reader;
pub mod writer;

pub use reader::{ParsedCar, parse_car_bytes, read_car, read_car_header};
pub use writer::{export_repo_car, export_repo_car_bytes, write_car, write_car_bytes};
