pub mod consumer;
pub mod face_model;
pub mod frames;
pub mod processor;
pub mod queue;
pub mod stager;
pub mod storage;
pub mod transcode;
