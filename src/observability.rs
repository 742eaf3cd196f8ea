//! Metrics facade.
//!
//! Thin helpers over the `metrics` macros so call sites stay one-liners
//! and label names live in one place. An exporter is wired by the host
//! process, not here.

pub mod metrics {
    pub fn set_active_servers(count: usize) {
        ::metrics::gauge!("registry_servers_active").set(count as f64);
    }

    pub fn set_active_proxies(count: usize) {
        ::metrics::gauge!("registry_proxies_active").set(count as f64);
    }

    pub fn entity_parked() {
        ::metrics::counter!("registry_entities_parked_total").increment(1);
    }

    pub fn entity_released() {
        ::metrics::counter!("registry_entities_released_total").increment(1);
    }

    pub fn route_assigned() {
        ::metrics::counter!("registry_routes_assigned_total").increment(1);
    }

    pub fn route_failed(reason: &'static str) {
        ::metrics::counter!("registry_routes_failed_total", "reason" => reason).increment(1);
    }

    pub fn bus_message(channel: &'static str) {
        ::metrics::counter!("registry_bus_messages_total", "channel" => channel).increment(1);
    }

    pub fn set_family_remaining(family: &str, server: &str, remaining: u32) {
        ::metrics::gauge!(
            "registry_family_capacity_remaining",
            "family" => family.to_string(),
            "server" => server.to_string()
        )
        .set(remaining as f64);
    }
}
