// qbridge-testkit: shared test utilities for the bridge client suite.
//
// Provides a mock REQ/REP RPC server and a mock PUB event publisher for
// integration testing of the socket pool, parameter/history subsystems, and
// the event pipeline without a live trading terminal.

pub mod mock_event_publisher;
pub mod mock_rpc_server;

pub use mock_event_publisher::MockEventPublisher;
pub use mock_rpc_server::{MockReply, MockRpcServer};
