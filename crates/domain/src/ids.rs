//! Identifier formats shared by the control plane and workers.
//!
//! Every identifier that crosses the control-plane ↔ worker boundary has a
//! fixed shape. The patterns here are the single source of truth; the
//! validator and the assignment executor both check against them.

use std::sync::OnceLock;

use regex::Regex;

macro_rules! id_pattern {
    ($fn_name:ident, $pattern:literal) => {
        pub fn $fn_name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("static id pattern"))
        }
    };
}

id_pattern!(run_id_pattern, r"^run_[0-9a-f]{16,64}$");
id_pattern!(execution_id_pattern, r"^exe_[0-9a-f]{8,64}$");
id_pattern!(worker_id_pattern, r"^wkr_[0-9a-f]{8,64}$");
id_pattern!(stage_id_pattern, r"^stg_[0-9a-f]{3,81}$");
id_pattern!(vu_id_pattern, r"^vu_[0-9]{1,10}$");
id_pattern!(scenario_id_pattern, r"^scn_[a-z0-9][a-z0-9._-]{2,80}$");
id_pattern!(lease_id_pattern, r"^lse_[0-9a-f]{8,64}$");
id_pattern!(event_id_pattern, r"^evt_[0-9a-f]{8,64}$");
id_pattern!(session_id_pattern, r"^[A-Za-z0-9_.-]{1,256}$");
