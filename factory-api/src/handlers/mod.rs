mod app;
mod events;
mod stats;

pub use app::add_routes;

#[cfg(test)]
mod test_utils;
