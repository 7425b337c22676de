pub mod tunnel;

pub use tunnel::TunnelService;
