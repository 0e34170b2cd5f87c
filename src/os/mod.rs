// src/os/mod.rs

pub mod epoll;
pub mod signals;
