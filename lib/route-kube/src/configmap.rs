//! Write-back of the routes record

use kube::api::PostParams;
use tracing::info;

use route_api::{canonical_string, RouteRecord};
use route_core::Result;

use crate::KubeClient;

/// The routes ConfigMap shipped by the chart for a release
pub fn routes_config_map_name(release: &str) -> String {
    format!("{}-strongswan-routes", release)
}

impl KubeClient {
    /// Replace the data of the existing routes ConfigMap with `record`.
    ///
    /// The chart creates the ConfigMap; a missing one is an error.
    pub async fn publish_routes(&self, name: &str, record: &RouteRecord) -> Result<()> {
        let api = self.config_maps();
        let mut cm = api.get(name).await?;
        let data = record.to_data();
        info!("   config map data: {}", canonical_string(&data));
        cm.data = Some(data);
        api.replace(name, &PostParams::default(), &cm).await?;
        info!("   updated config map: {}", name);
        Ok(())
    }
}
