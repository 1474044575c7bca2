pub mod app;
pub mod assets;
pub mod controls;
pub mod fps;
pub mod options;
pub mod panel;
pub mod render;
pub mod solution;
pub mod video;
