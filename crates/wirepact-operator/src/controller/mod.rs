//! Reconcilers for the WirePact custom resources

pub mod ca;
pub mod participant;
