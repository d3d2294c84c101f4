//! Middleware hooks over inbound messages.

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::transport::{IncomingRequest, IncomingResponse};

/// An ordered middleware chain member.
///
/// Services run after the transaction and dialog layers and before the
/// dialplan. A service consumes a message by `take()`-ing it out of the
/// option; the chain stops once the message is gone.
#[async_trait::async_trait]
#[allow(unused_variables)]
pub trait SipService: Sync + Send + 'static {
    /// Returns the service name.
    fn name(&self) -> &str;

    /// Called for every inbound request not claimed by a transaction or
    /// dialog.
    async fn on_incoming_request(
        &self,
        endpoint: &Endpoint,
        request: &mut Option<IncomingRequest>,
    ) -> Result<()> {
        Ok(())
    }

    /// Called for every inbound response not claimed by a transaction
    /// or dialog.
    async fn on_incoming_response(
        &self,
        endpoint: &Endpoint,
        response: &mut Option<IncomingResponse>,
    ) -> Result<()> {
        Ok(())
    }
}
