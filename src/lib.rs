//! Face Swap Pipeline Worker
//!
//! This library provides the asynchronous media pipeline behind the face swap
//! service: it stages job inputs from storage, swaps faces in images or
//! frame-by-frame in videos, uploads the result and records the job outcome.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
