//! Live voice call engine: microphone capture, a duplex connection to a
//! realtime voice model, playback of the model's audio and a running
//! transcript, driven by one [`controller::CallController`].

pub mod audio;
pub mod config;
pub mod controller;
pub mod gui_bridge;
pub mod net_link;
pub mod protocol;
pub mod state_machine;
pub mod transcript;
