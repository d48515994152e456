#![allow(dead_code)]

pub mod budget_alloc;
pub mod fixtures;
pub mod generated;
pub mod session_stub;
