//! Sockets, addresses and write backpressure.
//!
//! - [`address`]: `unix://` / `tcp://` address parsing
//! - [`handle`]: [`IoHandle`], one non-blocking descriptor plus its metadata
//! - [`listener`]: listening sockets
//! - [`overflow`]: file-backed spill buffers and the open-handle ceiling
//! - [`stream`]: [`Stream`], the backpressure writer

pub mod address;
pub mod handle;
pub mod listener;
pub mod overflow;
pub mod stream;

pub use address::{Scheme, SocketAddress};
pub use handle::{Family, HandleId, IoHandle, Peer, Transport};
pub use listener::{Listener, connect};
pub use overflow::{HandleLimiter, HandlePermit, OverflowBuffer};
pub use stream::{Drain, Stream};

use std::cell::RefCell;
use std::rc::Rc;

/// A socket stream shared between a worker, the buffer service and tasks.
pub type SharedStream = Rc<RefCell<Stream<IoHandle>>>;
