// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Operation Execution
//!
//! Every provider verb runs through [`OperationExecutor::exec`]: parameters
//! are validated first, then the connection and the channel are made ready,
//! then the verb body runs on the channel. Invalid parameters never reach the
//! broker.

use crate::{
    channel::ChannelManager,
    connection::ConnectionManager,
    errors::AmqpError,
    transport::BrokerChannel,
    validation::{self, Params},
};
use std::{future::Future, sync::Arc};
use tracing::{error, warn};

/// Result of a verb, with the validated parameters it ran with.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<P, R> {
    pub result: R,
    pub params: P,
}

pub struct OperationExecutor {
    connection: Arc<ConnectionManager>,
    channel: Arc<ChannelManager>,
}

impl OperationExecutor {
    pub fn new(connection: Arc<ConnectionManager>, channel: Arc<ChannelManager>) -> Self {
        OperationExecutor {
            connection,
            channel,
        }
    }

    /// Runs `body` with validated parameters on a ready channel.
    ///
    /// # Parameters
    /// * `op` - Verb name, for logging
    /// * `params` - Parameters, validated against `P::pattern()`
    /// * `body` - The verb itself
    ///
    /// # Returns
    /// The body's result together with the validated parameters. Errors of
    /// any stage are logged and returned unchanged.
    pub async fn exec<P, R, F, Fut>(
        &self,
        op: &'static str,
        params: P,
        body: F,
    ) -> Result<Outcome<P, R>, AmqpError>
    where
        P: Params,
        F: FnOnce(Arc<dyn BrokerChannel>, P) -> Fut,
        Fut: Future<Output = Result<R, AmqpError>>,
    {
        let params = validation::check(params).map_err(|err| {
            warn!(op, error = err.to_string(), "rejecting invalid parameters");
            AmqpError::from(err)
        })?;

        self.connection.connect(false).await.map_err(|err| {
            error!(op, error = err.to_string(), "no connection to run the operation on");
            err
        })?;
        let channel = self.channel.channel(false).await.map_err(|err| {
            error!(op, error = err.to_string(), "no channel to run the operation on");
            err
        })?;

        match body(channel, params.clone()).await {
            Ok(result) => Ok(Outcome { result, params }),
            Err(err) => {
                error!(op, error = err.to_string(), "operation failed");
                Err(err)
            }
        }
    }
}
