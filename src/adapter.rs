mod irq; pub use irq::InterruptAdapter;
mod poll; pub use poll::{IrqTimestampWaker, NoWake, PollAdapter, WakeSource};
