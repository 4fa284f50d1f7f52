use core::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use snowlease::{
    CUSTOM_EPOCH, DEFAULT_BACKUP_COUNT, DEFAULT_COUNTER_BITS, DEFAULT_MAX_LOGICAL_NODE_COUNT,
    DEFAULT_PARTITION_COUNT, Epoch, LocalClusterConfig, SequenceDefinition,
};

/// Runtime configuration for the `snowlease-node` binary.
///
/// Boots an in-process cluster, attaches generators on every member and
/// generates IDs from all of them concurrently, optionally failing the
/// sequence's partition owner halfway through. All values are parsed from CLI
/// arguments or environment variables.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "snowlease-node",
    version,
    about = "Runs a local snowlease cluster and generates leased Snowflake-style IDs"
)]
pub struct CliArgs {
    /// Number of cluster members.
    ///
    /// Environment variable: `MEMBERS`
    #[arg(long, env = "MEMBERS", default_value_t = 3)]
    pub members: usize,

    /// Number of partitions the sequence-name space is split into.
    ///
    /// Environment variable: `PARTITION_COUNT`
    #[arg(long, env = "PARTITION_COUNT", default_value_t = DEFAULT_PARTITION_COUNT)]
    pub partition_count: u32,

    /// Name of the sequence to create.
    ///
    /// Environment variable: `SEQUENCE_NAME`
    #[arg(long, env = "SEQUENCE_NAME", default_value_t = String::from("ids"))]
    pub sequence_name: String,

    /// Upper bound on concurrently leased logical node ids. Determines the
    /// width of the node field.
    ///
    /// Environment variable: `MAX_LOGICAL_NODE_COUNT`
    #[arg(long, env = "MAX_LOGICAL_NODE_COUNT", default_value_t = DEFAULT_MAX_LOGICAL_NODE_COUNT)]
    pub max_logical_node_count: u32,

    /// Width of the per-millisecond counter field.
    ///
    /// Environment variable: `COUNTER_BITS`
    #[arg(long, env = "COUNTER_BITS", default_value_t = DEFAULT_COUNTER_BITS)]
    pub counter_bits: u32,

    /// Synchronous backups of the sequence's allocation table.
    ///
    /// Environment variable: `BACKUP_COUNT`
    #[arg(long, env = "BACKUP_COUNT", default_value_t = DEFAULT_BACKUP_COUNT)]
    pub backup_count: usize,

    /// Epoch of the timestamp field, in milliseconds since 1970-01-01 UTC.
    ///
    /// Environment variable: `EPOCH_MILLIS`
    #[arg(long, env = "EPOCH_MILLIS", default_value_t = CUSTOM_EPOCH.as_millis() as u64)]
    pub epoch_millis: u64,

    /// Generators attached on each member.
    ///
    /// Environment variable: `GENERATORS_PER_MEMBER`
    #[arg(long, env = "GENERATORS_PER_MEMBER", default_value_t = 2)]
    pub generators_per_member: usize,

    /// IDs each generator produces per round. Two rounds are run.
    ///
    /// Environment variable: `IDS_PER_GENERATOR`
    #[arg(long, env = "IDS_PER_GENERATOR", default_value_t = 100_000)]
    pub ids_per_generator: usize,

    /// Back-off while a millisecond's counter space is exhausted, in
    /// microseconds.
    ///
    /// Environment variable: `RETRY_INTERVAL_MICROS`
    #[arg(long, env = "RETRY_INTERVAL_MICROS", default_value_t = 100)]
    pub retry_interval_micros: u64,

    /// Fail the partition owner of the sequence between the two rounds.
    #[arg(long, default_value_t = false)]
    pub fail_owner: bool,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub cluster: LocalClusterConfig,
    pub definition: SequenceDefinition,
    pub generators_per_member: usize,
    pub ids_per_generator: usize,
    pub fail_owner: bool,
}

impl NodeConfig {
    pub const fn total_generators(&self) -> usize {
        self.cluster.members * self.generators_per_member
    }
}

impl TryFrom<CliArgs> for NodeConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.members == 0 {
            bail!("MEMBERS must be greater than 0");
        }
        if args.generators_per_member == 0 {
            bail!("GENERATORS_PER_MEMBER must be greater than 0");
        }
        if args.fail_owner && args.members < 2 {
            bail!("--fail-owner needs at least 2 members");
        }

        let generators = args
            .members
            .checked_mul(args.generators_per_member)
            .ok_or_else(|| anyhow::anyhow!("Overflow in generator count"))?;
        if generators > args.max_logical_node_count as usize {
            bail!(
                "MEMBERS * GENERATORS_PER_MEMBER ({generators}) exceeds MAX_LOGICAL_NODE_COUNT ({})",
                args.max_logical_node_count
            );
        }

        let definition = SequenceDefinition::builder(args.sequence_name)
            .epoch(Epoch::from_unix_millis(args.epoch_millis))
            .max_logical_node_count(args.max_logical_node_count)
            .counter_bits(args.counter_bits)
            .backup_count(args.backup_count)
            .build()
            .context("Invalid sequence definition")?;

        Ok(Self {
            cluster: LocalClusterConfig {
                members: args.members,
                partition_count: args.partition_count,
                retry_interval: Duration::from_micros(args.retry_interval_micros),
                ..LocalClusterConfig::default()
            },
            definition,
            generators_per_member: args.generators_per_member,
            ids_per_generator: args.ids_per_generator,
            fail_owner: args.fail_owner,
        })
    }
}
