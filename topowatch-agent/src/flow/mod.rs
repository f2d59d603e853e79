//! Flow capture targets: receive filtered packets and mirror them out

pub mod erspan;
