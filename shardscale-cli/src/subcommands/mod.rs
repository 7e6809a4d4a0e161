mod simulate;
pub use simulate::SimulateApp;

mod state;
pub use state::StateApp;
