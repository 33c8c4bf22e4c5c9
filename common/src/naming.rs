//! Deterministic file names for every store a task reads or writes.
//!
//! Any reduce task `r` can find bucket `r` of every map task `m` as
//! `map_{m}_output_{r}.kv` without asking anybody where it lives.

pub fn map_source_file(m: usize) -> String {
    format!("map_{m}_source.kv")
}

pub fn map_input_file(m: usize) -> String {
    format!("map_{m}_input.kv")
}

pub fn map_output_file(m: usize, r: usize) -> String {
    format!("map_{m}_output_{r}.kv")
}

pub fn reduce_partial_file(r: usize, m: usize) -> String {
    format!("reduce_{r}_partial_{m}.kv")
}

pub fn reduce_input_file(r: usize) -> String {
    format!("reduce_{r}_input.kv")
}

pub fn reduce_output_file(r: usize) -> String {
    format!("reduce_{r}_output.kv")
}
