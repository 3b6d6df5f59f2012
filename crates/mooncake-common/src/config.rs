//! Environment-variable configuration (§6 configuration table).
//!
//! A transfer-engine node has no project directory to read a config file
//! from, so this crate keeps only the env-var-over-built-in-default
//! tier: every row of the §6 table gets a typed accessor with the
//! documented default, parsed once into a [`Config`] at engine
//! construction.

use std::env;
use std::time::Duration;

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_parsed_any<T: std::str::FromStr>(names: &[&str], default: T) -> T {
    for name in names {
        if let Some(v) = env::var(name).ok().and_then(|v| v.parse().ok()) {
            return v;
        }
    }
    default
}

/// Path MTU, negotiated during RDMA QP setup (§4.6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mtu {
    Mtu512,
    Mtu1024,
    Mtu2048,
    Mtu4096,
}

impl std::str::FromStr for Mtu {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "512" => Ok(Self::Mtu512),
            "1024" => Ok(Self::Mtu1024),
            "2048" => Ok(Self::Mtu2048),
            "4096" => Ok(Self::Mtu4096),
            _ => Err(()),
        }
    }
}

/// Full configuration for one transfer-engine node, assembled from the
/// §6 environment variables at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub num_cq_per_ctx: usize,
    pub num_comp_channels_per_ctx: usize,
    pub ib_port: u8,
    pub gid_index: u8,
    pub max_cqe_per_ctx: u32,
    pub max_ep_per_ctx: usize,
    pub num_qp_per_ep: usize,
    pub max_sge: u32,
    pub max_wr: u32,
    pub max_inline: u32,
    pub mtu: Mtu,
    pub handshake_port: u16,
    /// Bytes per slice (§4.5.3 step 2).
    pub slice_size: u64,
    /// Max per-slice retries (§4.5.6).
    pub retry_cnt: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_cq_per_ctx: 1,
            num_comp_channels_per_ctx: 1,
            ib_port: 1,
            gid_index: 3,
            max_cqe_per_ctx: 4096,
            max_ep_per_ctx: 256,
            num_qp_per_ep: 2,
            max_sge: 4,
            max_wr: 256,
            max_inline: 64,
            mtu: Mtu::Mtu4096,
            handshake_port: 12001,
            slice_size: 65536,
            retry_cnt: 8,
        }
    }
}

impl Config {
    /// Loads configuration from the process environment, falling back to
    /// §6's documented defaults for any var that is unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            num_cq_per_ctx: env_parsed("MC_NUM_CQ_PER_CTX", defaults.num_cq_per_ctx),
            num_comp_channels_per_ctx: env_parsed(
                "MC_NUM_COMP_CHANNELS_PER_CTX",
                defaults.num_comp_channels_per_ctx,
            ),
            ib_port: env_parsed("MC_IB_PORT", defaults.ib_port),
            gid_index: env_parsed_any(
                &["MC_GID_INDEX", "NCCL_IB_GID_INDEX"],
                defaults.gid_index,
            ),
            max_cqe_per_ctx: env_parsed("MC_MAX_CQE_PER_CTX", defaults.max_cqe_per_ctx),
            max_ep_per_ctx: env_parsed("MC_MAX_EP_PER_CTX", defaults.max_ep_per_ctx),
            num_qp_per_ep: env_parsed("MC_NUM_QP_PER_EP", defaults.num_qp_per_ep),
            max_sge: env_parsed("MC_MAX_SGE", defaults.max_sge),
            max_wr: env_parsed("MC_MAX_WR", defaults.max_wr),
            max_inline: env_parsed("MC_MAX_INLINE", defaults.max_inline),
            mtu: env_parsed("MC_MTU", defaults.mtu),
            handshake_port: env_parsed("MC_HANDSHAKE_PORT", defaults.handshake_port),
            slice_size: env_parsed("slice_size", defaults.slice_size),
            retry_cnt: env_parsed("retry_cnt", defaults.retry_cnt),
        }
    }

    /// Per-socket-operation timeout for handshake networking (§4.1, §5).
    pub fn handshake_socket_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Accept-loop poll timeout for the handshake daemon (§4.1, §5).
    pub fn handshake_accept_timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Bound on the transfer worker's condition-variable wait (§5).
    pub fn worker_idle_wait(&self) -> Duration {
        Duration::from_secs(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = Config::default();
        assert_eq!(cfg.max_cqe_per_ctx, 4096);
        assert_eq!(cfg.max_ep_per_ctx, 256);
        assert_eq!(cfg.num_qp_per_ep, 2);
        assert_eq!(cfg.slice_size, 65536);
        assert_eq!(cfg.retry_cnt, 8);
        assert_eq!(cfg.handshake_port, 12001);
        assert_eq!(cfg.gid_index, 3);
    }

    #[test]
    fn env_override_takes_precedence() {
        // SAFETY: test runs single-threaded w.r.t. this var via serial
        // access to the process environment; no other test in this
        // module touches MC_MAX_WR.
        unsafe {
            env::set_var("MC_MAX_WR", "512");
        }
        let cfg = Config::from_env();
        assert_eq!(cfg.max_wr, 512);
        unsafe {
            env::remove_var("MC_MAX_WR");
        }
    }

    #[test]
    fn gid_index_falls_back_to_nccl_var() {
        unsafe {
            env::remove_var("MC_GID_INDEX");
            env::set_var("NCCL_IB_GID_INDEX", "5");
        }
        let cfg = Config::from_env();
        assert_eq!(cfg.gid_index, 5);
        unsafe {
            env::remove_var("NCCL_IB_GID_INDEX");
        }
    }

    #[test]
    fn unparsable_env_var_falls_back_to_default() {
        unsafe {
            env::set_var("MC_IB_PORT", "not-a-number");
        }
        let cfg = Config::from_env();
        assert_eq!(cfg.ib_port, Config::default().ib_port);
        unsafe {
            env::remove_var("MC_IB_PORT");
        }
    }
}
