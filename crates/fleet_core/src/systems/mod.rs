//! One system per event kind. Each system runs inside the schedule built by
//! [`crate::runner::simulation_schedule`], gated on the current event's kind.

pub mod environment_idle;
pub mod environment_update;
pub mod hold;
pub mod optimize;
pub mod passenger_alight;
pub mod passenger_assignment;
pub mod passenger_board;
pub mod passenger_ready;
pub mod passenger_release;
pub mod vehicle_arrival;
pub mod vehicle_boarding;
pub mod vehicle_departure;
pub mod vehicle_notification;
pub mod vehicle_release;
