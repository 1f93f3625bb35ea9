//! Application services: the render pipeline and the persistence seams it uses.

pub mod error;
pub mod render;
pub mod repos;
