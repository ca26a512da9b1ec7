pub mod image_controller;

pub use image_controller::ImageStore;
