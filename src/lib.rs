pub mod acquire;
pub mod amqp;
pub mod app;
pub mod archive;
pub mod batch;
pub mod bundle;
pub mod config;
pub mod consumer;
pub mod convert;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod object_store;
pub mod output;
pub mod pipeline;
pub mod process;
pub mod publish;
pub mod sigv4;
pub mod token;
pub mod tus;
