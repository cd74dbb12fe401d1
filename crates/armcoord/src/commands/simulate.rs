use anyhow::Context;
use armcoord_cloud::{
    CloudError, LockRegistry, OperationContext, PollConfig, ResourceId, read_modify_write,
};
use armcoord_config::{OperationKind, Settings};
use armcoord_network::{
    IpConfiguration, NetworkInterface, SimulatedNetwork, SimulatorConfig, Subnet, VirtualNetwork,
};
use clap::Args;
use colored::Colorize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

const SUBSCRIPTION: &str = "00000000-0000-0000-0000-000000000000";
const RESOURCE_GROUP: &str = "rg-simulation";
const PROVIDER: &str = "Microsoft.Network";
const IP_CONFIGURATION: &str = "ipconfig1";

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// 種類ごとの並行操作数
    #[arg(short = 'n', long, default_value_t = 8)]
    pub operations: usize,
    /// ロックを取らずに read-modify-write を並行実行する
    #[arg(long)]
    pub unlocked: bool,
    /// GET のレイテンシ（ミリ秒）
    #[arg(long, default_value_t = 20)]
    pub read_latency_ms: u64,
    /// 長時間実行操作の完了までの時間（ミリ秒）
    #[arg(long, default_value_t = 10)]
    pub operation_latency_ms: u64,
    /// 更新後に Updating を返す GET の回数
    #[arg(long, default_value_t = 1)]
    pub settle_reads: u32,
    /// ポーリング間隔（ミリ秒、設定ファイルの値を上書き）
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,
    /// 結果をJSONで出力
    #[arg(long)]
    pub json: bool,
}

fn resource_id(kind: &str, name: &str) -> ResourceId {
    ResourceId::new(SUBSCRIPTION, RESOURCE_GROUP, PROVIDER, kind, name)
}

fn vnet_id() -> ResourceId {
    resource_id("virtualNetworks", "vnet-1")
}

fn nic_id() -> ResourceId {
    resource_id("networkInterfaces", "nic-1")
}

fn pool_id(index: usize) -> ResourceId {
    resource_id("loadBalancers", "lb-1").child("backendAddressPools", format!("pool-{index}"))
}

fn subnet(index: usize) -> Subnet {
    Subnet::new(
        format!("subnet-{index}"),
        format!("10.0.{}.0/24", index % 256),
    )
}

fn seed(config: SimulatorConfig) -> SimulatedNetwork {
    let network = SimulatedNetwork::new(config);
    network
        .virtual_networks
        .insert(&vnet_id(), VirtualNetwork::new("vnet-1", &["10.0.0.0/8"]));
    network.network_interfaces.insert(
        &nic_id(),
        NetworkInterface::new(
            "nic-1",
            vec![IpConfiguration::new(IP_CONFIGURATION).primary()],
        ),
    );
    network
}

fn poll_config(settings: &Settings, args: &SimulateArgs) -> PollConfig {
    let mut poll = settings.polling.clone();
    if let Some(interval_ms) = args.poll_interval_ms {
        let interval = Duration::from_millis(interval_ms);
        let max = poll.max_poll_interval().max(interval);
        poll = poll.with_poll_interval(interval).with_max_poll_interval(max);
    }
    poll
}

/// 同じNICとVNetに対して並行に更新をかけ、失われた更新を数える
pub async fn handle(settings: &Settings, args: SimulateArgs) -> anyhow::Result<()> {
    if args.operations == 0 {
        anyhow::bail!("--operations は 1 以上を指定してください");
    }

    let network = seed(SimulatorConfig::new(
        Duration::from_millis(args.read_latency_ms),
        Duration::from_millis(args.operation_latency_ms),
        args.settle_reads,
    ));
    let poll = poll_config(settings, &args);
    let timeout = settings.timeouts.for_operation(OperationKind::Update);
    let lock_timeout = settings.locks.acquire_timeout();

    let mode = if args.unlocked { "ロックなし" } else { "ロックあり" };
    if !args.json {
        println!(
            "{} ({}, 種類ごとに {} 並行操作)",
            "シミュレーション開始".blue(),
            mode.cyan(),
            args.operations
        );
    }

    let started = Instant::now();
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    if args.unlocked {
        for i in 0..args.operations {
            let nics = Arc::clone(&network.network_interfaces);
            tasks.spawn(async move {
                let pool = pool_id(i).to_string();
                read_modify_write(nics.as_ref(), &nic_id(), |nic: &mut NetworkInterface| {
                    let Some(config) = nic.ip_configuration_mut(IP_CONFIGURATION) else {
                        return Ok(false);
                    };
                    config.load_balancer_backend_address_pool_ids.push(pool);
                    Ok::<_, CloudError>(true)
                })
                .await?;
                Ok(())
            });

            let vnets = Arc::clone(&network.virtual_networks);
            tasks.spawn(async move {
                read_modify_write(vnets.as_ref(), &vnet_id(), |vnet: &mut VirtualNetwork| {
                    vnet.subnets.push(subnet(i));
                    Ok::<_, CloudError>(true)
                })
                .await?;
                Ok(())
            });
        }
    } else {
        let provider = Arc::new(
            network
                .provider(Arc::new(LockRegistry::new()))
                .with_poll_config(poll),
        );

        for i in 0..args.operations {
            let provider_for_pool = Arc::clone(&provider);
            tasks.spawn(async move {
                let ctx = OperationContext::new(format!("associate pool-{i}"), timeout)
                    .with_lock_timeout(lock_timeout);
                provider_for_pool
                    .associate_nic_backend_pool(&ctx, &nic_id(), IP_CONFIGURATION, &pool_id(i))
                    .await?;
                Ok(())
            });

            let provider_for_subnet = Arc::clone(&provider);
            tasks.spawn(async move {
                let ctx = OperationContext::new(format!("create subnet-{i}"), timeout)
                    .with_lock_timeout(lock_timeout);
                provider_for_subnet
                    .create_subnet(&ctx, &vnet_id(), subnet(i))
                    .await?;
                Ok(())
            });
        }
    }

    let mut failures = 0usize;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.context("操作タスクが異常終了しました")?;
        if let Err(e) = outcome {
            failures += 1;
            tracing::warn!(error = %e, "Operation failed");
            if !args.json {
                eprintln!("  {} {}", "✗".red(), e);
            }
        }
    }
    let elapsed = started.elapsed();

    let pools = network
        .network_interfaces
        .snapshot(&nic_id())
        .and_then(|nic| {
            nic.ip_configuration(IP_CONFIGURATION)
                .map(|config| config.load_balancer_backend_address_pool_ids.len())
        })
        .unwrap_or(0);
    let subnets = network
        .virtual_networks
        .snapshot(&vnet_id())
        .map_or(0, |vnet| vnet.subnets.len());

    let expected = args.operations * 2;
    let lost = expected.saturating_sub(pools + subnets + failures);

    if args.json {
        let report = serde_json::json!({
            "mode": if args.unlocked { "unlocked" } else { "locked" },
            "operations": expected,
            "backend_pools": pools,
            "subnets": subnets,
            "failures": failures,
            "lost_updates": lost,
            "puts": network.network_interfaces.put_count() + network.virtual_networks.put_count(),
            "elapsed_ms": u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        println!(
            "  バックエンドプール: 期待 {} / 実際 {}",
            args.operations,
            pools.to_string().cyan()
        );
        println!(
            "  サブネット:         期待 {} / 実際 {}",
            args.operations,
            subnets.to_string().cyan()
        );
        println!("  失敗した操作: {}", failures);
        println!("  失われた更新: {}", lost);
        println!("  経過時間: {}ms", elapsed.as_millis());
        println!();
        if lost == 0 {
            println!("{}", "✓ すべての更新が保持されました".green().bold());
        } else {
            println!(
                "{}",
                format!("⚠ {} 件中 {} 件の更新が失われました", expected, lost)
                    .yellow()
                    .bold()
            );
        }
    }

    tracing::info!(
        unlocked = args.unlocked,
        expected,
        pools,
        subnets,
        failures,
        lost,
        "Simulation finished"
    );

    if failures > 0 {
        anyhow::bail!("{} 件の操作が失敗しました", failures);
    }
    if lost > 0 && !args.unlocked {
        anyhow::bail!("ロックありで {} 件の更新が失われました", lost);
    }
    Ok(())
}
