//! Service wiring and the method dispatcher.
//!
//! [`MonitorServices`] builds the three engines on one shared data manager
//! and guardian, connects the stats and resources cascades to thresholds
//! when configured, and exposes a string-keyed [`MonitorServices::call`]
//! for transports.

mod sv1;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::cache::Cache;
use crate::config::MonitorConfig;
use crate::error::{MonitorError, MonitorResult, ValidationError};
use crate::filters::FilterService;
use crate::guardian::Guardian;
use crate::resources::ResourceService;
use crate::stats::StatService;
use crate::storage::{DataDb, DataManager};
use crate::thresholds::{ActionExecutor, ThresholdProcessor, ThresholdService};

pub use sv1::{
    AdminSv1, IndexFamily, ReindexArgs, ResourceSv1, StatSv1, StatsEventArgs, TenantArg, ThresholdSv1, OK, PONG,
};

/// All enabled services of one node.
pub struct MonitorServices {
    dm: Arc<DataManager>,
    stats: Option<Arc<StatService>>,
    resources: Option<Arc<ResourceService>>,
    thresholds: Option<Arc<ThresholdService>>,
}

impl MonitorServices {
    /// Builds and starts the services enabled in `cfg`.
    ///
    /// # Errors
    ///
    /// Invalid configuration, or a backup thread that failed to start.
    pub fn new(cfg: &MonitorConfig, db: Arc<dyn DataDb>, actions: Arc<dyn ActionExecutor>) -> MonitorResult<Self> {
        cfg.validate()?;
        let dm = Arc::new(DataManager::new(db, Arc::new(Cache::new())));
        let guardian = Arc::new(Guardian::new());
        let timeout = cfg.general.locking_timeout;
        let filters_for = |nested: bool| Arc::new(FilterService::new(Arc::clone(&dm), nested));

        let thresholds = cfg.thresholds.enabled.then(|| {
            Arc::new(ThresholdService::new(
                Arc::clone(&dm),
                filters_for(cfg.thresholds.indexing.nested_fields),
                Arc::clone(&guardian),
                cfg.thresholds.clone(),
                timeout,
                actions,
            ))
        });
        let cascade = |conns: &[String]| -> Option<Arc<dyn ThresholdProcessor>> {
            if conns.is_empty() {
                return None;
            }
            thresholds
                .as_ref()
                .map(|t| Arc::clone(t) as Arc<dyn ThresholdProcessor>)
        };

        let stats = cfg.stats.enabled.then(|| {
            let svc = StatService::new(
                Arc::clone(&dm),
                filters_for(cfg.stats.indexing.nested_fields),
                Arc::clone(&guardian),
                cfg.stats.clone(),
                timeout,
            );
            Arc::new(match cascade(&cfg.stats.threshold_conns) {
                Some(t) => svc.with_thresholds(t),
                None => svc,
            })
        });
        let resources = cfg.resources.enabled.then(|| {
            let svc = ResourceService::new(
                Arc::clone(&dm),
                filters_for(cfg.resources.indexing.nested_fields),
                Arc::clone(&guardian),
                cfg.resources.clone(),
                timeout,
            );
            Arc::new(match cascade(&cfg.resources.threshold_conns) {
                Some(t) => svc.with_thresholds(t),
                None => svc,
            })
        });

        let started = |e: std::io::Error| MonitorError::internal(format!("backup thread: {e}"));
        if let Some(s) = &thresholds {
            s.start().map_err(started)?;
        }
        if let Some(s) = &stats {
            s.start().map_err(started)?;
        }
        if let Some(s) = &resources {
            s.start().map_err(started)?;
        }
        tracing::info!(
            node = %cfg.general.node_id,
            stats = stats.is_some(),
            resources = resources.is_some(),
            thresholds = thresholds.is_some(),
            "services started"
        );

        Ok(Self {
            dm,
            stats,
            resources,
            thresholds,
        })
    }

    #[must_use]
    pub const fn data_manager(&self) -> &Arc<DataManager> {
        &self.dm
    }

    #[must_use]
    pub fn stat_sv1(&self) -> Option<StatSv1> {
        self.stats.as_ref().map(|s| StatSv1::new(Arc::clone(s)))
    }

    #[must_use]
    pub fn resource_sv1(&self) -> Option<ResourceSv1> {
        self.resources.as_ref().map(|s| ResourceSv1::new(Arc::clone(s)))
    }

    #[must_use]
    pub fn threshold_sv1(&self) -> Option<ThresholdSv1> {
        self.thresholds.as_ref().map(|s| ThresholdSv1::new(Arc::clone(s)))
    }

    #[must_use]
    pub fn admin_sv1(&self) -> AdminSv1 {
        AdminSv1::new(
            Arc::clone(&self.dm),
            self.stats.clone(),
            self.resources.clone(),
            self.thresholds.clone(),
        )
    }

    /// Stops backup threads and flushes dirty instances. Producers
    /// (stats, resources) go first so their last cascades are persisted too.
    pub fn shutdown(&self) {
        if let Some(s) = &self.stats {
            s.shutdown();
        }
        if let Some(s) = &self.resources {
            s.shutdown();
        }
        if let Some(s) = &self.thresholds {
            s.shutdown();
        }
    }

    /// Invokes `"<Service>.<Method>"` with JSON parameters.
    ///
    /// # Errors
    ///
    /// `UnknownMethod`, `InvalidParams`, or whatever the method returns,
    /// already folded for callers.
    pub fn call(&self, method: &str, params: Value) -> MonitorResult<Value> {
        let (service, name) = method
            .split_once('.')
            .ok_or_else(|| unknown(method))?;
        match service {
            "StatSv1" => {
                let sv1 = self.stat_sv1().ok_or_else(|| disabled(service))?;
                call_stats(&sv1, method, name, params)
            }
            "ResourceSv1" => {
                let sv1 = self.resource_sv1().ok_or_else(|| disabled(service))?;
                call_resources(&sv1, method, name, params)
            }
            "ThresholdSv1" => {
                let sv1 = self.threshold_sv1().ok_or_else(|| disabled(service))?;
                call_thresholds(&sv1, method, name, params)
            }
            "AdminSv1" => call_admin(&self.admin_sv1(), method, name, params),
            _ => Err(unknown(method)),
        }
    }
}

fn unknown(method: &str) -> MonitorError {
    ValidationError::UnknownMethod {
        method: method.to_string(),
    }
    .into()
}

fn disabled(service: &str) -> MonitorError {
    MonitorError::ServerError {
        message: format!("{service} disabled"),
    }
}

fn params<T: DeserializeOwned>(method: &str, params: Value) -> MonitorResult<T> {
    serde_json::from_value(params).map_err(|e| {
        ValidationError::InvalidParams {
            method: method.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn reply<T: Serialize>(value: MonitorResult<T>) -> MonitorResult<Value> {
    serde_json::to_value(value?).map_err(|e| MonitorError::ServerError {
        message: format!("encoding reply: {e}"),
    })
}

fn call_stats(sv1: &StatSv1, method: &str, name: &str, p: Value) -> MonitorResult<Value> {
    match name {
        "Ping" => reply(Ok(sv1.ping())),
        "ProcessEvent" => reply(sv1.process_event(&params(method, p)?)),
        "GetStatQueuesForEvent" => reply(sv1.get_stat_queues_for_event(&params(method, p)?)),
        "GetStatQueue" => reply(sv1.get_stat_queue(&params(method, p)?)),
        "GetQueueIDs" => reply(sv1.get_queue_ids(&params(method, p)?)),
        "GetQueueStringMetrics" => reply(sv1.get_queue_string_metrics(&params(method, p)?)),
        "GetQueueFloatMetrics" => reply(sv1.get_queue_float_metrics(&params(method, p)?)),
        _ => Err(unknown(method)),
    }
}

fn call_resources(sv1: &ResourceSv1, method: &str, name: &str, p: Value) -> MonitorResult<Value> {
    match name {
        "Ping" => reply(Ok(sv1.ping())),
        "AuthorizeResources" => reply(sv1.authorize_resources(&params(method, p)?)),
        "AllocateResources" => reply(sv1.allocate_resources(&params(method, p)?)),
        "ReleaseResources" => reply(sv1.release_resources(&params(method, p)?)),
        "GetResourcesForEvent" => reply(sv1.get_resources_for_event(&params(method, p)?)),
        "GetResource" => reply(sv1.get_resource(&params(method, p)?)),
        "GetResourceIDs" => reply(sv1.get_resource_ids(&params(method, p)?)),
        _ => Err(unknown(method)),
    }
}

fn call_thresholds(sv1: &ThresholdSv1, method: &str, name: &str, p: Value) -> MonitorResult<Value> {
    match name {
        "Ping" => reply(Ok(sv1.ping())),
        "ProcessEvent" => reply(sv1.process_event(&params(method, p)?)),
        "GetThresholdsForEvent" => reply(sv1.get_thresholds_for_event(&params(method, p)?)),
        "GetThreshold" => reply(sv1.get_threshold(&params(method, p)?)),
        "GetThresholdIDs" => reply(sv1.get_threshold_ids(&params(method, p)?)),
        "ResetThreshold" => reply(sv1.reset_threshold(&params(method, p)?)),
        _ => Err(unknown(method)),
    }
}

fn call_admin(sv1: &AdminSv1, method: &str, name: &str, p: Value) -> MonitorResult<Value> {
    match name {
        "Ping" => reply(Ok(sv1.ping())),
        "SetFilter" => reply(sv1.set_filter(params(method, p)?)),
        "GetFilter" => reply(sv1.get_filter(&params(method, p)?)),
        "RemoveFilter" => reply(sv1.remove_filter(&params(method, p)?)),
        "SetStatQueueProfile" => reply(sv1.set_stat_queue_profile(params(method, p)?)),
        "GetStatQueueProfile" => reply(sv1.get_stat_queue_profile(&params(method, p)?)),
        "RemoveStatQueueProfile" => reply(sv1.remove_stat_queue_profile(&params(method, p)?)),
        "SetResourceProfile" => reply(sv1.set_resource_profile(params(method, p)?)),
        "GetResourceProfile" => reply(sv1.get_resource_profile(&params(method, p)?)),
        "RemoveResourceProfile" => reply(sv1.remove_resource_profile(&params(method, p)?)),
        "SetThresholdProfile" => reply(sv1.set_threshold_profile(params(method, p)?)),
        "GetThresholdProfile" => reply(sv1.get_threshold_profile(&params(method, p)?)),
        "RemoveThresholdProfile" => reply(sv1.remove_threshold_profile(&params(method, p)?)),
        "Reindex" => reply(sv1.reindex(&params(method, p)?)),
        _ => Err(unknown(method)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreInterval;
    use crate::storage::InMemoryDb;
    use crate::thresholds::LogActionExecutor;
    use serde_json::json;

    fn services() -> MonitorServices {
        let mut cfg = MonitorConfig::default();
        cfg.stats.enabled = true;
        cfg.stats.store_interval = StoreInterval::Synchronous;
        cfg.resources.enabled = true;
        MonitorServices::new(&cfg, Arc::new(InMemoryDb::new()), Arc::new(LogActionExecutor)).unwrap()
    }

    #[test]
    fn test_ping_every_enabled_service() {
        let svc = services();
        for method in ["StatSv1.Ping", "ResourceSv1.Ping", "AdminSv1.Ping"] {
            assert_eq!(svc.call(method, Value::Null).unwrap(), json!("Pong"));
        }
        let err = svc.call("ThresholdSv1.Ping", Value::Null).unwrap_err();
        assert!(matches!(err, MonitorError::ServerError { .. }));
    }

    #[test]
    fn test_unknown_method_and_bad_params() {
        let svc = services();
        assert!(matches!(
            svc.call("StatSv1.Nope", Value::Null).unwrap_err(),
            MonitorError::Validation(ValidationError::UnknownMethod { .. })
        ));
        assert!(matches!(
            svc.call("NoDot", Value::Null).unwrap_err(),
            MonitorError::Validation(ValidationError::UnknownMethod { .. })
        ));
        assert!(matches!(
            svc.call("StatSv1.GetStatQueue", json!(42)).unwrap_err(),
            MonitorError::Validation(ValidationError::InvalidParams { .. })
        ));
    }

    #[test]
    fn test_profile_then_event_through_dispatcher() {
        let svc = services();
        svc.call(
            "AdminSv1.SetStatQueueProfile",
            json!({
                "tenant": "cgrates.org",
                "id": "SQ1",
                "filter_ids": ["*string:~Account:1001"],
                "metrics": [{"metric_id": "*tcc"}],
                "stored": true
            }),
        )
        .unwrap();

        let ids = svc
            .call(
                "StatSv1.ProcessEvent",
                json!({"tenant": "cgrates.org", "id": "e1", "event": {"Account": "1001", "Cost": 2.5}}),
            )
            .unwrap();
        assert_eq!(ids, json!(["SQ1"]));

        let metrics = svc
            .call("StatSv1.GetQueueFloatMetrics", json!({"tenant": "cgrates.org", "id": "SQ1"}))
            .unwrap();
        assert_eq!(metrics, json!({"*tcc": 2.5}));

        let missing = svc
            .call("StatSv1.GetQueueIDs", json!({"tenant": ""}))
            .unwrap_err();
        assert_eq!(missing.to_string(), "MANDATORY_IE_MISSING: [Tenant]");
    }
}
