pub mod events;
pub mod items;
pub mod runs;
