//! Message Router
//!
//! Turns the subscribers matched for a topic into one delivery per client.
//! A client matched through several of its filters gets a single copy at
//! the highest granted QoS, carrying every matching subscription id.

use std::sync::Arc;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::protocol::{Publish, QoS};
use crate::topic::Subscriber;

/// One client's share of a routed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Route {
    pub client_id: Arc<str>,
    /// Highest QoS granted by the matching subscriptions
    pub max_qos: QoS,
    /// Any matching subscription asked to keep the retain flag
    pub retain_as_published: bool,
    pub subscription_ids: SmallVec<[u32; 2]>,
}

impl Route {
    /// Build the copy of `publish` sent to this client
    pub fn outgoing(&self, publish: &Publish) -> Publish {
        let mut outgoing = publish.clone();
        outgoing.dup = false;
        outgoing.packet_id = None;
        outgoing.qos = publish.qos.min(self.max_qos);
        outgoing.retain = publish.retain && self.retain_as_published;
        outgoing.properties.subscription_identifiers = self.subscription_ids.to_vec();
        outgoing
    }
}

/// Collects matched subscribers into per-client routes
pub(crate) struct RoutePlanner<'a> {
    /// Publishing client, for no-local filtering
    publisher: Option<&'a str>,
    routes: SmallVec<[Route; 16]>,
    index: AHashMap<Arc<str>, usize>,
}

impl<'a> RoutePlanner<'a> {
    pub fn new(publisher: Option<&'a str>) -> Self {
        Self {
            publisher,
            routes: SmallVec::new(),
            index: AHashMap::new(),
        }
    }

    pub fn add(&mut self, subscriber: &Subscriber) {
        if subscriber.options.no_local && self.publisher == Some(&*subscriber.client_id) {
            return;
        }

        let route = match self.index.get(&subscriber.client_id) {
            Some(&i) => &mut self.routes[i],
            None => {
                self.index
                    .insert(subscriber.client_id.clone(), self.routes.len());
                self.routes.push(Route {
                    client_id: subscriber.client_id.clone(),
                    max_qos: QoS::AtMostOnce,
                    retain_as_published: false,
                    subscription_ids: SmallVec::new(),
                });
                let last = self.routes.len() - 1;
                &mut self.routes[last]
            }
        };

        if subscriber.options.max_qos > route.max_qos {
            route.max_qos = subscriber.options.max_qos;
        }
        route.retain_as_published |= subscriber.options.retain_as_published;
        if let Some(id) = subscriber.subscription_id {
            route.subscription_ids.push(id);
        }
    }

    /// Routes in first-match order
    pub fn finish(self) -> SmallVec<[Route; 16]> {
        self.routes
    }
}
