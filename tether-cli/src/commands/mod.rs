mod doctor;

pub use doctor::run_doctor;
