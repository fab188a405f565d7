//! End-to-end behaviour of a booted kernel.

use std::error::Error;
use std::sync::{Arc, Mutex};

use esta_kernel::{
    AdmissionRequest, AdmittedModule, AuditEvent, AuditLog, FairnessFloors, ManualClock,
    ModuleSigner, ProcessState, SliceOutcome, TerminationReason,
};
use esta_runtime::drivers::clock_reading;
use esta_runtime::{
    ClockDriver, Kernel, KernelConfig, ModuleFactory, ModuleInstance, SliceContext, SliceReport,
};
use esta_types::{
    EstaError, Message, MessageFlags, MessageKind, ModuleManifest, ModulePriority, Priority,
    Rights,
};

type TestResult = Result<(), Box<dyn Error>>;

fn signer() -> ModuleSigner {
    ModuleSigner::from_seed([42; 32])
}

fn boot(configure: impl FnOnce(&mut KernelConfig)) -> (Kernel, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let mut config = KernelConfig::new(signer().verifier());
    configure(&mut config);
    let kernel = Kernel::boot_with_clock(config, clock.clone()).expect("kernel boots");
    (kernel, clock)
}

fn bundle(manifest: ModuleManifest) -> AdmissionRequest {
    let bytes = format!("{}@{}", manifest.name, manifest.version).into_bytes();
    AdmissionRequest {
        signature: signer().sign_module(&bytes),
        module_bytes: bytes,
        manifest,
    }
}

fn manifest(name: &str, runtime: &str, caps: &[&str]) -> ModuleManifest {
    let mut m = ModuleManifest::new(name, "1.0.0", runtime);
    m.capabilities_required = caps.iter().map(|c| c.to_string()).collect();
    m
}

struct FnModule<F>(F);

impl<F> ModuleInstance for FnModule<F>
where
    F: FnMut(&mut SliceContext) -> SliceReport + Send,
{
    fn run_slice(&mut self, ctx: &mut SliceContext) -> SliceReport {
        (self.0)(ctx)
    }
}

struct Scripted<F>(F);

impl<F> ModuleFactory for Scripted<F>
where
    F: FnMut(&mut SliceContext) -> SliceReport + Clone + Send + Sync + 'static,
{
    fn instantiate(&self, _module: &AdmittedModule) -> Result<Box<dyn ModuleInstance>, EstaError> {
        Ok(Box::new(FnModule(self.0.clone())))
    }
}

/// Back `runtime` with a closure; every instance starts from a clone of it.
fn script<F>(kernel: &Kernel, runtime: &str, body: F)
where
    F: FnMut(&mut SliceContext) -> SliceReport + Clone + Send + Sync + 'static,
{
    kernel.register_runtime(runtime, Arc::new(Scripted(body)));
}

// ── capabilities ────────────────────────────────────────────────────────────

#[test]
fn delegation_chain_only_narrows() -> TestResult {
    let (kernel, _) = boot(|c| {
        c.authority
            .allow_str("ledger", "db:read+write:accounts")
            .expect("authority");
    });
    let a = kernel.admit(bundle(manifest("ledger", "builtin:spin", &["db:read+write:accounts"])))?;
    let b = kernel.admit(bundle(manifest("report", "builtin:spin", &[])))?;
    let c = kernel.admit(bundle(manifest("viewer", "builtin:spin", &[])))?;

    let root = kernel.capabilities_of(a)[0].id;
    let child = kernel.delegate(a, root, b, Rights::READ | Rights::WRITE)?;
    let grandchild = kernel.delegate(b, child.id, c, Rights::READ)?;
    assert_eq!(grandchild.rights, Rights::READ);
    assert_eq!(grandchild.parent, Some(child.id));

    let err = kernel.delegate(c, grandchild.id, a, Rights::WRITE).unwrap_err();
    assert!(matches!(err, EstaError::AttenuationViolation { .. }));

    // Only the holder may pass a capability on.
    let err = kernel.delegate(c, child.id, c, Rights::READ).unwrap_err();
    assert!(matches!(err, EstaError::Unauthorized { .. }));

    assert_eq!(kernel.revoke(root)?, 3);
    for id in [root, child.id, grandchild.id] {
        assert!(!kernel.engine().validate(id, Rights::READ));
    }
    assert!(kernel.verify_audit().valid);
    Ok(())
}

#[test]
fn second_revocation_is_a_recorded_noop() -> TestResult {
    let (kernel, _) = boot(|c| c.authority.allow_str("reader", "db:read").expect("authority"));
    let pid = kernel.admit(bundle(manifest("reader", "builtin:spin", &["db:read"])))?;
    let cap = kernel.capabilities_of(pid)[0].id;

    let head = kernel.audit().len() as u64;
    assert_eq!(kernel.revoke(cap)?, 1);
    assert_eq!(kernel.revoke(cap)?, 0);

    let tail = kernel.audit().entries_since(head);
    let flags: Vec<bool> = tail
        .iter()
        .filter_map(|e| match e.event {
            AuditEvent::CapabilityRevoked { cap_id, noop, .. } if cap_id == cap => Some(noop),
            _ => None,
        })
        .collect();
    assert_eq!(flags, vec![false, true]);
    assert!(kernel.engine().get(cap).expect("kept for audit").revoked);
    Ok(())
}

#[test]
fn unauthorized_write_leaves_module_with_nothing() {
    let (kernel, _) = boot(|c| c.authority.allow_str("reporter", "db:read").expect("authority"));
    let err = kernel
        .admit(bundle(manifest("reporter", "builtin:spin", &["db:read", "db:write"])))
        .unwrap_err();
    assert!(matches!(err, EstaError::Denied { .. }));

    assert!(kernel.modules().is_empty());
    assert!(kernel.processes().is_empty());
    // Only the kernel's own channel capability is live.
    assert_eq!(kernel.engine().stats().live, 1);

    let log = kernel.audit().export();
    assert!(log.iter().any(|e| matches!(&e.event,
        AuditEvent::CapabilityDenied { resource, .. } if resource.starts_with("db"))));
    assert!(log.iter().any(|e| matches!(&e.event,
        AuditEvent::ModuleRejected { module, .. } if module == "reporter")));
}

#[test]
fn foreign_signature_is_rejected() {
    let (kernel, _) = boot(|_| {});
    let mut req = bundle(manifest("rogue", "builtin:spin", &[]));
    req.signature = ModuleSigner::from_seed([9; 32]).sign_module(&req.module_bytes);
    assert_eq!(
        kernel.admit(req).unwrap_err(),
        EstaError::InvalidSignature { module: "rogue".into() }
    );
}

// ── messaging ───────────────────────────────────────────────────────────────

#[test]
fn messages_arrive_in_send_order() -> TestResult {
    let (kernel, _) = boot(|c| {
        c.authority
            .allow_str("producer", "messaging:send:consumer")
            .expect("authority");
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    script(&kernel, "test:consumer", move |ctx| {
        while let Ok(Some(msg)) = ctx.recv() {
            sink.lock().unwrap().push((msg.sequence, msg.payload[0]));
        }
        SliceReport::new(1, SliceOutcome::WaitMessage)
    });
    let mut sent = false;
    script(&kernel, "test:producer", move |ctx| {
        if !sent {
            let to = ctx.lookup("consumer").expect("consumer mailbox");
            for i in 1..=20u8 {
                ctx.send(to, Priority::Normal, vec![i], MessageFlags::empty())
                    .expect("authorized send");
            }
            sent = true;
        }
        SliceReport::new(1, SliceOutcome::WaitMessage)
    });

    kernel.admit(bundle(manifest("consumer", "test:consumer", &[])))?;
    kernel.admit(bundle(manifest("producer", "test:producer", &["messaging:send:consumer"])))?;
    kernel.run_epoch()?;

    let expected: Vec<(u64, u8)> = (1..=20u8).map(|i| (u64::from(i), i)).collect();
    assert_eq!(*seen.lock().unwrap(), expected);
    Ok(())
}

#[test]
fn echo_answers_the_kernel() -> TestResult {
    let (kernel, _) = boot(|c| c.authority.allow_str("echo", "messaging:send:kernel").expect("authority"));
    let echo = kernel.admit(bundle(manifest("echo", "builtin:echo", &["messaging:send:kernel"])))?;

    kernel.post(echo, Priority::High, MessageKind::Ping, b"hello")?;
    kernel.run_epoch()?;

    let reply = kernel.receive()?.expect("pong queued for the kernel");
    assert_eq!(reply.source, echo);
    assert_eq!(reply.kind(), Some(MessageKind::Pong));
    assert_eq!(reply.body(), b"hello");
    assert_eq!(reply.priority, Priority::High);
    assert!(reply.flags.contains(MessageFlags::REPLY));
    Ok(())
}

#[test]
fn lazy_module_waits_for_its_first_message() -> TestResult {
    let (kernel, _) = boot(|_| {});
    let mut m = manifest("lazy", "builtin:echo", &[]);
    m.priority = ModulePriority::Lazy;
    let pid = kernel.admit(bundle(m))?;

    assert_eq!(kernel.process(pid).unwrap().state, ProcessState::Admitted);
    assert_eq!(kernel.run_epoch()?.slices, 0);

    kernel.post(pid, Priority::Normal, MessageKind::Ping, &[])?;
    let report = kernel.run_epoch()?;
    assert_eq!(report.slices, 1);
    assert_eq!(report.per_class[Priority::Low.index()], 1);
    Ok(())
}

#[test]
fn terminated_target_fails_the_pending_request() -> TestResult {
    let (kernel, _) = boot(|c| c.authority.allow_str("asker", "messaging:send:sink").expect("authority"));

    script(&kernel, "test:sink", |_ctx| SliceReport::new(1, SliceOutcome::WaitMessage));
    let answer = Arc::new(Mutex::new(None));
    let out = answer.clone();
    let mut asked = false;
    script(&kernel, "test:asker", move |ctx| {
        if !asked {
            let to = ctx.lookup("sink").expect("sink mailbox");
            ctx.send(
                to,
                Priority::Normal,
                vec![MessageKind::AccrualRequest.code()],
                MessageFlags::REPLY_EXPECTED,
            )
            .expect("authorized request");
            asked = true;
            return SliceReport::new(1, SliceOutcome::WaitMessage);
        }
        match ctx.recv() {
            Ok(Some(reply)) => {
                *out.lock().unwrap() = Some(reply);
                SliceReport::new(1, SliceOutcome::Exited)
            }
            _ => SliceReport::new(1, SliceOutcome::WaitMessage),
        }
    });
    let sink = kernel.admit(bundle(manifest("sink", "test:sink", &[])))?;
    let asker = kernel.admit(bundle(manifest("asker", "test:asker", &["messaging:send:sink"])))?;

    kernel.run_epoch()?;
    assert!(matches!(kernel.process(asker).unwrap().state, ProcessState::Blocked(_)));

    assert!(kernel.terminate(sink)?);
    assert_eq!(kernel.process(asker).unwrap().state, ProcessState::Runnable);
    kernel.run_epoch()?;

    let reply = answer.lock().unwrap().take().expect("asker got an answer");
    assert_eq!(reply.source, sink);
    assert_eq!(reply.kind(), Some(MessageKind::Error));
    assert!(reply.flags.contains(MessageFlags::SYSTEM | MessageFlags::REPLY));
    assert_eq!(reply.error(), Some(EstaError::ModuleTerminated { pid: sink }));
    assert_eq!(
        kernel.process(asker).unwrap().state,
        ProcessState::Terminated(TerminationReason::Exited)
    );
    Ok(())
}

#[test]
fn request_limit_comes_from_the_manifest() -> TestResult {
    let (kernel, _) = boot(|c| c.authority.allow_str("eager", "messaging:send:sink").expect("authority"));

    script(&kernel, "test:sink", |_ctx| SliceReport::new(1, SliceOutcome::WaitMessage));
    let results = Arc::new(Mutex::new(Vec::new()));
    let out = results.clone();
    script(&kernel, "test:eager", move |ctx| {
        let to = ctx.lookup("sink").expect("sink mailbox");
        for n in 0..3u8 {
            let sent = ctx.send(to, Priority::Normal, vec![n], MessageFlags::REPLY_EXPECTED);
            out.lock().unwrap().push(sent.map(|_| ()));
        }
        SliceReport::new(1, SliceOutcome::Exited)
    });
    kernel.admit(bundle(manifest("sink", "test:sink", &[])))?;
    let mut m = manifest("eager", "test:eager", &["messaging:send:sink"]);
    m.resource_limits.max_concurrent_requests = 2;
    let eager = kernel.admit(bundle(m))?;

    kernel.run_epoch()?;
    assert_eq!(
        *results.lock().unwrap(),
        vec![Ok(()), Ok(()), Err(EstaError::QuotaExceeded { pid: eager })]
    );
    Ok(())
}

#[test]
fn memory_ceiling_comes_from_the_manifest() -> TestResult {
    let (kernel, _) = boot(|_| {});
    let seen = Arc::new(Mutex::new(None));
    let out = seen.clone();
    script(&kernel, "test:hungry", move |ctx| {
        *out.lock().unwrap() = Some(ctx.memory_limit());
        match ctx.ensure_memory(4096) {
            Ok(()) => SliceReport::new(1, SliceOutcome::Exited),
            Err(err) => SliceReport::new(1, SliceOutcome::Trapped(err.to_string())),
        }
    });
    let mut m = manifest("hungry", "test:hungry", &[]);
    m.resource_limits.max_memory = 1024;
    let pid = kernel.admit(bundle(m))?;

    kernel.run_epoch()?;
    assert_eq!(*seen.lock().unwrap(), Some(1024));
    assert!(matches!(
        kernel.process(pid).unwrap().state,
        ProcessState::Terminated(TerminationReason::Trapped(_))
    ));
    Ok(())
}

// ── scheduling ──────────────────────────────────────────────────────────────

#[test]
fn quota_breach_terminates_and_discards_pending_output() -> TestResult {
    let (kernel, _) = boot(|c| c.authority.allow_str("chatty", "messaging:send:sink").expect("authority"));

    // Never reads its mailbox, so everything chatty sends stays queued.
    script(&kernel, "test:sink", |_ctx| SliceReport::new(1, SliceOutcome::WaitMessage));
    script(&kernel, "test:chatty", |ctx| {
        let to = ctx.lookup("sink").expect("sink mailbox");
        let _ = ctx.send(to, Priority::Normal, vec![0xAA], MessageFlags::empty());
        SliceReport::new(ctx.slice_ms(), SliceOutcome::Preempted)
    });

    let sink = kernel.admit(bundle(manifest("sink", "test:sink", &[])))?;
    let mut m = manifest("chatty", "test:chatty", &["messaging:send:sink"]);
    m.resource_limits.max_execution_time_ms = 500;
    let chatty = kernel.admit(bundle(m))?;

    let report = kernel.run_epoch()?;
    let record = kernel.process(chatty).expect("record kept");
    assert_eq!(
        record.state,
        ProcessState::Terminated(TerminationReason::QuotaExceeded)
    );
    assert_eq!(record.runtime_used_ms, 500);
    assert!(report.terminated.iter().any(|(pid, _)| *pid == chatty));

    // Nothing chatty sent survives it.
    assert_eq!(kernel.router().pending(sink), 0);
    let log = kernel.audit().export();
    assert!(!log.iter().any(|e| matches!(e.event,
        AuditEvent::MessageDelivered { source, .. } if source == chatty)));
    let dropped = log
        .iter()
        .filter(|e| matches!(&e.event,
            AuditEvent::MessageDropped { source, reason, .. }
                if *source == chatty && reason == "source terminated"))
        .count();
    assert_eq!(dropped, 20);

    // Its capabilities are gone and neither direction routes any more.
    assert!(kernel.capabilities_of(chatty).iter().all(|c| c.revoked));
    let err = kernel
        .send(Message::new(chatty, sink, Priority::Normal, vec![1]))
        .unwrap_err();
    assert_eq!(err, EstaError::ModuleTerminated { pid: chatty });
    let err = kernel
        .post(chatty, Priority::Normal, MessageKind::Ping, &[])
        .unwrap_err();
    assert_eq!(err, EstaError::ModuleTerminated { pid: chatty });
    Ok(())
}

fn spinner(name: &str, priority: ModulePriority) -> AdmissionRequest {
    let mut m = manifest(name, "builtin:spin", &[]);
    m.priority = priority;
    bundle(m)
}

#[test]
fn low_priority_floor_survives_critical_load() -> TestResult {
    let (kernel, _) = boot(|c| {
        c.epoch_length = 16;
        c.floors = FairnessFloors {
            low: 2,
            ..FairnessFloors::NONE
        };
    });
    kernel.admit(spinner("hot", ModulePriority::Critical))?;
    kernel.admit(spinner("cold", ModulePriority::Low))?;

    for _ in 0..3 {
        let report = kernel.run_epoch()?;
        assert_eq!(report.slices, 16);
        assert_eq!(report.per_class[Priority::Low.index()], 2);
        assert_eq!(report.per_class[Priority::Critical.index()], 14);
    }
    Ok(())
}

#[test]
fn without_a_floor_low_starves() -> TestResult {
    let (kernel, _) = boot(|c| {
        c.epoch_length = 16;
        c.floors = FairnessFloors::NONE;
    });
    kernel.admit(spinner("hot", ModulePriority::Critical))?;
    kernel.admit(spinner("cold", ModulePriority::Low))?;

    let report = kernel.run_epoch()?;
    assert_eq!(report.per_class[Priority::Low.index()], 0);
    Ok(())
}

// ── audit ───────────────────────────────────────────────────────────────────

#[test]
fn tampering_invalidates_every_later_range() -> TestResult {
    let (kernel, clock) = boot(|_| {});
    for n in 0..4 {
        kernel.admit(bundle(manifest(&format!("m{n}"), "builtin:echo", &[])))?;
    }
    let mut entries = kernel.audit().export();
    let head = entries.len() as u64;
    assert!(head >= 6);

    entries[2].event = AuditEvent::KernelShutdown {
        reason: "forged".into(),
    };
    let copy = AuditLog::import(entries, clock);
    assert!(copy.verify(1..=2));
    assert!(!copy.verify(3..=3));
    assert!(!copy.verify(4..=head));
    assert!(!copy.verify(head..=head));
    assert_eq!(copy.verify_report(..).first_invalid, Some(3));

    let err = copy
        .append(AuditEvent::KernelShutdown { reason: "late".into() }, "test")
        .unwrap_err();
    assert!(matches!(err, EstaError::AuditChainCorruption { .. }));

    // The live chain was never touched.
    assert!(kernel.verify_audit().valid);
    Ok(())
}

// ── drivers and async dispatch ──────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn module_reads_time_from_clock_driver() -> TestResult {
    let (kernel, clock) = boot(|c| {
        c.authority
            .allow_str("timekeeper", "messaging:send:driver.clock")
            .expect("authority");
    });
    let kernel = Arc::new(kernel);
    kernel.attach_driver(Arc::new(ClockDriver::new(clock.clone())))?;
    clock.set(5_000);

    let reading = Arc::new(Mutex::new(None));
    let out = reading.clone();
    let mut asked = false;
    script(&kernel, "test:timekeeper", move |ctx| {
        if !asked {
            let driver = ctx.lookup(ClockDriver::NAME).expect("driver mailbox");
            ctx.send(
                driver,
                Priority::Normal,
                vec![MessageKind::Ping.code()],
                MessageFlags::REPLY_EXPECTED,
            )
            .expect("authorized request");
            asked = true;
            return SliceReport::new(1, SliceOutcome::AwaitDriver);
        }
        match ctx.recv() {
            Ok(Some(reply)) => {
                *out.lock().unwrap() = clock_reading(&reply);
                SliceReport::new(1, SliceOutcome::Exited)
            }
            _ => SliceReport::new(1, SliceOutcome::AwaitDriver),
        }
    });
    let pid = kernel.admit(bundle(manifest(
        "timekeeper",
        "test:timekeeper",
        &["messaging:send:driver.clock"],
    )))?;

    let report = kernel.run_epoch_async(2).await?;
    assert_eq!(report.driver_requests, 1);
    assert_eq!(*reading.lock().unwrap(), Some(5_000));
    assert_eq!(
        kernel.process(pid).unwrap().state,
        ProcessState::Terminated(TerminationReason::Exited)
    );
    Ok(())
}

#[test]
fn reaching_a_driver_needs_its_channel_capability() -> TestResult {
    let (kernel, clock) = boot(|_| {});
    let driver = kernel.attach_driver(Arc::new(ClockDriver::new(clock)))?;
    let outsider = kernel.admit(bundle(manifest("outsider", "builtin:spin", &[])))?;

    let err = kernel
        .send(Message::typed(outsider, driver, Priority::Normal, MessageKind::Ping, &[]))
        .unwrap_err();
    assert!(matches!(err, EstaError::Unauthorized { .. }));
    Ok(())
}

#[tokio::test]
async fn step_async_runs_one_slice() -> TestResult {
    let (kernel, _) = boot(|_| {});
    let kernel = Arc::new(kernel);
    let pid = kernel.admit(spinner("spin", ModulePriority::High))?;

    let step = kernel.step_async().await?.expect("dispatched");
    assert_eq!(step.pid, pid);
    assert_eq!(step.used_ms, 15);
    assert_eq!(kernel.process(pid).unwrap().runtime_used_ms, 15);
    Ok(())
}
