pub mod clock;
pub mod shutdown;
pub mod state;
pub mod trading_loop;

pub use clock::{Clock, SimulatedClock, SystemClock};
pub use shutdown::{Shutdown, ShutdownHandle};
pub use state::{InFlightOrders, MarketState};
pub use trading_loop::{TradingContext, TradingLoop};
