// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use crate::config::{Configuration, SyncConfiguration};
use crate::node::Node;
use crate::test_utils::{MemoryStream, MemoryStreamStore, TestNodeRegistry};
use crate::types::{NodeAddress, StreamId};

/// Node of a [`TestCluster`] with its in-memory stream store.
pub struct TestClusterNode {
    pub address: NodeAddress,
    pub store: Arc<MemoryStreamStore>,
    pub node: Node,
}

/// Nodes running in one process. Each node reaches the others through their sync handlers.
pub struct TestCluster {
    pub registry: Arc<TestNodeRegistry>,
    pub nodes: Vec<TestClusterNode>,
}

impl TestCluster {
    pub async fn start(size: usize, sync: SyncConfiguration) -> Self {
        let registry = TestNodeRegistry::new();
        let mut nodes = Vec::with_capacity(size);

        for index in 0..size {
            let address = NodeAddress::new([index as u8 + 1; 20]);
            let store = MemoryStreamStore::new(address);

            let node = Node::start(
                Configuration {
                    node_address: address,
                    sync: sync.clone(),
                },
                store.clone(),
                registry.clone(),
            )
            .await;

            registry.insert(address, Arc::new(node.handler().clone()));
            nodes.push(TestClusterNode {
                address,
                store,
                node,
            });
        }

        Self { registry, nodes }
    }

    /// Creates a stream which is replicated on the nodes with the given indices. Every other node
    /// knows where to find it. Returns the replicas in the order of `replicas`.
    pub fn create_stream(&self, stream_id: StreamId, replicas: &[usize]) -> Vec<Arc<MemoryStream>> {
        let mut streams = Vec::new();

        for (index, node) in self.nodes.iter().enumerate() {
            let is_local = replicas.contains(&index);
            let remotes = replicas
                .iter()
                .filter(|replica| **replica != index)
                .map(|replica| self.nodes[*replica].address)
                .collect();

            let stream = node.store.create_stream(stream_id, remotes, is_local);
            if is_local {
                streams.push((index, stream));
            }
        }

        replicas
            .iter()
            .filter_map(|replica| {
                streams
                    .iter()
                    .find(|(index, _)| index == replica)
                    .map(|(_, stream)| stream.clone())
            })
            .collect()
    }

    pub async fn shutdown(self) {
        for node in self.nodes {
            node.node.shutdown().await;
        }
    }
}
