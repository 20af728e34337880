// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::audit::{spawn_audit_sink, AuditHandle};
use crate::auth::AuthService;
use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::dispatch::{spawn_dispatcher, DispatcherHandle};
use crate::protocol::compress::Algorithm;
use crate::queue::CommandQueue;
use crate::registry::ConnectionRegistry;
use crate::store::Store;

/// Shared control-plane state. Components are constructor-injected; nothing
/// here is process-global.
pub struct ServerState {
    pub config: ServerConfig,
    pub shutdown: CancellationToken,
    pub registry: Arc<ConnectionRegistry>,
    pub queue: Arc<CommandQueue>,
    pub broadcaster: Arc<Broadcaster>,
    pub store: Arc<dyn Store>,
    pub auth: AuthService,
    pub audit: AuditHandle,
    pub dispatcher: DispatcherHandle,
}

impl ServerState {
    /// Wire all components and spawn the dispatcher and audit tasks.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn Store>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new(
            config.max_connections,
            config.outbound_queue_depth,
        ));
        let queue = Arc::new(CommandQueue::new(config.max_queue_length));
        let compression = Algorithm::parse(&config.compression);
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::clone(&registry),
            compression,
            config.compression_min_bytes,
        ));
        let auth = AuthService::new(&config);
        let audit_store: Arc<dyn crate::store::AuditStore> = store.clone();
        let audit = spawn_audit_sink(
            audit_store,
            config.audit_buffer_cap,
            config.audit_flush_interval(),
            shutdown.clone(),
        );
        let dispatcher = spawn_dispatcher(
            &config,
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&broadcaster),
            Arc::clone(&store),
            audit.clone(),
            shutdown.clone(),
        );

        Arc::new(Self {
            config,
            shutdown,
            registry,
            queue,
            broadcaster,
            store,
            auth,
            audit,
            dispatcher,
        })
    }
}
