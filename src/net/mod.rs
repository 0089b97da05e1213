//! TCP networking: the listener/accept and connect state machines layered
//! on the stream primitive.

pub mod tcp;

pub use self::tcp::{connect, listen, TcpListener};
