pub mod driver;
pub mod round;
pub mod trip;
