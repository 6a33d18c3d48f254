use crate::api::BufferStats;

pub fn render_stats(stats: &BufferStats, namespace: &str) -> String {
    let ns = if namespace.is_empty() {
        "tenantq"
    } else {
        namespace
    };

    let mut out = String::new();
    out.push_str(&format!(
        "# HELP {ns}_admitted_total Total entries admitted into the buffer\n# TYPE {ns}_admitted_total counter\n{ns}_admitted_total {}\n",
        stats.admitted
    ));
    out.push_str(&format!(
        "# HELP {ns}_dequeued_total Total entries handed to consumers\n# TYPE {ns}_dequeued_total counter\n{ns}_dequeued_total {}\n",
        stats.dequeued
    ));
    out.push_str(&format!(
        "# HELP {ns}_not_admitted_total Admissions refused by the tenant capacity policy\n# TYPE {ns}_not_admitted_total counter\n{ns}_not_admitted_total{{policy=\"accept\"}} {}\n{ns}_not_admitted_total{{policy=\"skip\"}} {}\n",
        stats.not_admitted_accept, stats.not_admitted_skip
    ));
    out.push_str(&format!(
        "# HELP {ns}_buffered Entries currently buffered\n# TYPE {ns}_buffered gauge\n{ns}_buffered {}\n",
        stats.buffered
    ));
    out.push_str(&format!(
        "# HELP {ns}_active_tenants Tenants with buffered entries\n# TYPE {ns}_active_tenants gauge\n{ns}_active_tenants {}\n",
        stats.active_tenants
    ));
    out.push_str(&format!(
        "# HELP {ns}_queue_time_sum_ns Sum of queue time in ns\n# TYPE {ns}_queue_time_sum_ns counter\n{ns}_queue_time_sum_ns {}\n",
        stats.queue_time_sum_ns
    ));
    out.push_str(&format!(
        "# HELP {ns}_queue_time_samples Total queue time samples\n# TYPE {ns}_queue_time_samples counter\n{ns}_queue_time_samples {}\n",
        stats.queue_time_samples
    ));

    if !stats.tenant_depths.is_empty() {
        out.push_str(&format!(
            "# HELP {ns}_tenant_buffered Entries buffered per active tenant\n# TYPE {ns}_tenant_buffered gauge\n"
        ));
        for entry in &stats.tenant_depths {
            out.push_str(&format!(
                "{ns}_tenant_buffered{{tenant=\"{}\"}} {}\n",
                entry.tenant, entry.depth
            ));
        }
    }

    out
}
