// tests/integration/lifecycle_test.rs

//! Service lifecycle: empty-DB step-up, CREATE finishing the step-up,
//! idempotent CREATE, stop, and the full multi-step creation driver.

use super::test_helpers::{GID, MODE, TestContext, UID};
use peridot::config::Config;
use peridot::core::PoolError;
use peridot::core::bootstrap;
use peridot::core::fabric::{Fabric, LocalFabric, RdbDist};
use peridot::core::pool_map::Rank;
use peridot::core::protocol::{PoolRequest, WireRc};
use peridot::core::svc::dispatch::LoopbackTransport;
use peridot::core::svc::{PoolModule, SvcState, create, lifecycle};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

#[tokio::test]
async fn empty_db_steps_up_to_up_empty() {
    let ctx = TestContext::new().await;
    assert_eq!(ctx.svc().state().await, SvcState::UpEmpty);
    assert_eq!(ctx.svc().cached_version().await, 0);
}

#[tokio::test]
async fn create_initializes_metadata_and_finishes_step_up() {
    let ctx = TestContext::new().await;
    let reply = ctx.create_pool().await;
    assert_eq!(reply.op().rc, WireRc::Ok);

    let svc = ctx.svc();
    assert_eq!(svc.state().await, SvcState::Up);
    assert_eq!(svc.cached_version().await, 1);
    assert_eq!(ctx.persisted_map_version().await, 1);
    assert_eq!(ctx.nhandles().await, 0);

    // The step-up created the pool fabric group.
    assert_eq!(ctx.fabric.targets.groups(), vec![ctx.pool]);
}

#[tokio::test]
async fn create_is_idempotent() {
    let ctx = TestContext::created().await;
    let before = ctx.persisted_map_version().await;

    // A second CREATE with the same pool UUID is a successful no-op, even
    // with different target UUIDs: the DB is already initialized.
    let reply = ctx.create_pool().await;
    assert_eq!(reply.op().rc, WireRc::Ok);
    assert_eq!(ctx.persisted_map_version().await, before);
    assert_eq!(ctx.nhandles().await, 0);
    assert_eq!(ctx.svc().state().await, SvcState::Up);
}

#[tokio::test]
async fn create_rejects_arity_mismatch() {
    let ctx = TestContext::new().await;
    let reply = ctx
        .module
        .handle(PoolRequest::Create {
            pool: ctx.pool.into(),
            uid: UID,
            gid: GID,
            mode: MODE,
            target_uuids: vec![Uuid::new_v4().into(), Uuid::new_v4().into()],
            target_ranks: vec![1, 2, 3],
            domains: vec![3],
        })
        .await;
    assert_eq!(reply.op().rc, WireRc::Proto);
    assert_eq!(ctx.svc().state().await, SvcState::UpEmpty);
}

#[tokio::test]
async fn create_rejects_inconsistent_domains() {
    let ctx = TestContext::new().await;
    let reply = ctx
        .module
        .handle(PoolRequest::Create {
            pool: ctx.pool.into(),
            uid: UID,
            gid: GID,
            mode: MODE,
            target_uuids: vec![Uuid::new_v4().into(), Uuid::new_v4().into()],
            target_ranks: vec![1, 2],
            domains: vec![3],
        })
        .await;
    assert_eq!(reply.op().rc, WireRc::Proto);
}

#[tokio::test]
async fn stop_takes_the_service_down_and_out_of_the_registry() {
    let ctx = TestContext::created().await;
    let svc = ctx.svc();

    let reply = ctx
        .module
        .handle(PoolRequest::Stop {
            op: ctx.op(Uuid::nil()),
        })
        .await;
    assert_eq!(reply.op().rc, WireRc::Ok);

    assert_eq!(svc.state().await, SvcState::Down);
    assert!(ctx.module.registry.get(ctx.pool).is_none());

    // Further RPCs bounce with a hint rather than a hard error.
    let reply = ctx.query(Uuid::nil()).await;
    assert_eq!(reply.op().rc, WireRc::NotLeader);
}

#[tokio::test]
async fn stop_on_a_non_leader_is_refused() {
    let ctx = TestContext::created().await;
    ctx.svc().rdb().demote().await;

    let reply = ctx
        .module
        .handle(PoolRequest::Stop {
            op: ctx.op(Uuid::nil()),
        })
        .await;
    assert_eq!(reply.op().rc, WireRc::NotLeader);
    assert!(ctx.module.registry.get(ctx.pool).is_some());
}

#[tokio::test]
async fn unknown_pool_is_nonexist_not_notleader() {
    let ctx = TestContext::created().await;
    let err = ctx.module.registry.lookup(Uuid::new_v4()).unwrap_err();
    assert_eq!(err, PoolError::Nonexist);
}

#[tokio::test]
async fn db_stop_callback_winds_the_service_down() {
    let ctx = TestContext::created().await;
    ctx.svc().rdb().trigger_stop(None).await;

    // The stopper runs detached; wait for it to pull the service out.
    for _ in 0..100 {
        if ctx.module.registry.get(ctx.pool).is_none() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("service was not stopped");
}

#[tokio::test]
async fn start_all_scans_the_storage_root() {
    let storage = tempfile::tempdir().unwrap();
    let config = Arc::new(Config {
        storage_path: storage.path().to_path_buf(),
        ..Config::default()
    });
    let fabric = LocalFabric::new(config.self_rank);
    let module = PoolModule::init(Arc::clone(&config), fabric.fabric.clone());

    // Two provisioned pools, one stray directory without an rdb.
    let pools = [Uuid::new_v4(), Uuid::new_v4()];
    for pool in pools {
        std::fs::create_dir_all(bootstrap::pool_dir(storage.path(), pool)).unwrap();
        bootstrap::rdb_uuid_store(storage.path(), pool, Uuid::new_v4()).unwrap();
    }
    std::fs::create_dir_all(bootstrap::pool_dir(storage.path(), Uuid::new_v4())).unwrap();

    lifecycle::start_all(&module.registry, fabric.fabric.clone(), Arc::clone(&config))
        .await
        .unwrap();

    assert_eq!(module.registry.all().len(), 2);
    for pool in pools {
        assert_eq!(
            module.registry.get(pool).unwrap().state().await,
            SvcState::UpEmpty
        );
    }

    lifecycle::stop_all(&module.registry).await;
    assert!(module.registry.all().is_empty());
}

#[tokio::test]
async fn svc_destroy_tears_down_the_fabric_state() {
    let ctx = TestContext::created().await;
    lifecycle::svc_destroy(&ctx.fabric.fabric, ctx.pool).await.unwrap();

    assert_eq!(ctx.fabric.rebuild.stopped(), vec![ctx.pool]);
    assert_eq!(ctx.fabric.rdb_dist.stopped(), vec![(ctx.pool, true)]);
    assert!(ctx.fabric.targets.groups().is_empty());
}

/// A distributed-DB manager that actually provisions pool services in this
/// process, standing in for the management service of a real deployment.
#[derive(Default)]
struct ProvisioningRdbDist {
    module: Mutex<Option<Arc<PoolModule>>>,
}

impl ProvisioningRdbDist {
    fn bind(&self, module: Arc<PoolModule>) {
        *self.module.lock() = Some(module);
    }
}

#[async_trait]
impl RdbDist for ProvisioningRdbDist {
    async fn dist_start(
        &self,
        db_uuid: Uuid,
        pool: Uuid,
        _ranks: &[Rank],
        _create: bool,
        _bootstrap: bool,
        _cap_bytes: u64,
    ) -> Result<(), PoolError> {
        let module = self.module.lock().clone().unwrap();
        let storage = module.registry.storage_root().clone();
        std::fs::create_dir_all(bootstrap::pool_dir(&storage, pool))?;
        bootstrap::rdb_uuid_store(&storage, pool, db_uuid)?;
        lifecycle::start(
            &module.registry,
            module.fabric.clone(),
            Arc::clone(&module.config),
            pool,
        )
        .await?;
        Ok(())
    }

    async fn dist_stop(
        &self,
        pool: Uuid,
        _ranks: Option<&[Rank]>,
        _destroy: bool,
    ) -> Result<(), PoolError> {
        let module = self.module.lock().clone().unwrap();
        lifecycle::stop(&module.registry, pool).await;
        Ok(())
    }
}

#[tokio::test]
async fn svc_create_drives_the_whole_creation_flow() {
    let storage = tempfile::tempdir().unwrap();
    let config = Arc::new(Config {
        storage_path: storage.path().to_path_buf(),
        ..Config::default()
    });
    let local = LocalFabric::new(config.self_rank);
    let dist = Arc::new(ProvisioningRdbDist::default());
    let fabric = Fabric {
        self_rank: config.self_rank,
        iv: local.iv.clone(),
        targets: local.targets.clone(),
        containers: local.containers.clone(),
        rebuild: local.rebuild.clone(),
        rdb_dist: dist.clone(),
    };
    let module = PoolModule::init(Arc::clone(&config), fabric);
    dist.bind(Arc::clone(&module));

    let pool = Uuid::new_v4();
    let transport = LoopbackTransport::new(Arc::clone(&module));
    let ranks = create::svc_create(
        &module,
        &transport,
        pool,
        UID,
        GID,
        MODE,
        vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()],
        vec![1, 2, 3],
        vec![3],
        3,
    )
    .await
    .unwrap();

    assert_eq!(ranks, vec![1, 2, 3]);
    let svc = module.registry.get(pool).unwrap();
    assert_eq!(svc.state().await, SvcState::Up);
    assert_eq!(svc.cached_version().await, 1);
}
