#![allow(non_snake_case)]

use types::Float;
pub extern crate nalgebra as na;

pub mod helpers;
pub mod kinematic;
pub mod plant;
pub mod rom;
pub mod solver;
pub mod trajopt;
pub mod types;
pub mod util;

pub const GRAVITY: Float = 9.81;

pub const PI: Float = std::f64::consts::PI;
pub const TWO_PI: Float = 2.0 * PI;
