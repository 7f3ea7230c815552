//! Concurrent cycles against one shared state.
//!
//! Each cycle has its own execution context; the agent registry they both
//! mutate must end up in a state reachable by running the two cycles one
//! after the other.

use std::sync::Arc;

use coordination::agent::LifecycleCommand;
use coordination::{
    AgentId, AgentState, CoordinationConfig, CoordinationRuntime, CycleInput, LifecycleEvent,
    ManualClock, Queryable,
};

fn runtime() -> Arc<CoordinationRuntime> {
    let runtime = CoordinationRuntime::builder(CoordinationConfig::default())
        .clock(Arc::new(ManualClock::starting_now()))
        .build()
        .unwrap();
    Arc::new(runtime)
}

fn advance(agent: &str, event: LifecycleEvent) -> CycleInput {
    CycleInput::Lifecycle(LifecycleCommand::Advance {
        agent_id: AgentId::from(agent),
        event,
    })
}

#[tokio::test]
async fn test_competing_transitions_serialize() {
    let runtime = runtime();
    runtime
        .lifecycle()
        .register(AgentId::from("shared"), Default::default())
        .unwrap();
    runtime.lifecycle().advance("shared", LifecycleEvent::Activate).unwrap();

    // Both contexts try Idle → Observing; only one can win.
    let (first, second) = tokio::join!(
        runtime.run_cycle(vec![advance("shared", LifecycleEvent::Observe)]),
        runtime.run_cycle(vec![advance("shared", LifecycleEvent::Observe)]),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    let applied = first.context.lifecycle.len() + second.context.lifecycle.len();
    let rejected = first.context.rejections.len() + second.context.rejections.len();
    assert_eq!(applied, 1);
    assert_eq!(rejected, 1);
    assert_ne!(first.report.cycle, second.report.cycle);

    let agent = runtime.lifecycle().query("shared").unwrap();
    assert_eq!(agent.state, AgentState::Observing);
    let observed = agent
        .transitions
        .iter()
        .filter(|t| t.from == AgentState::Idle && t.to == AgentState::Observing)
        .count();
    assert_eq!(observed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_cycles_leave_registry_consistent() {
    let runtime = runtime();
    runtime
        .lifecycle()
        .register(AgentId::from("shared"), Default::default())
        .unwrap();
    runtime.lifecycle().advance("shared", LifecycleEvent::Activate).unwrap();

    // One task walks the agent forward, the other deregisters it.
    let walker = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            runtime
                .run_cycle(vec![advance("shared", LifecycleEvent::Observe)])
                .await
                .map(|run| run.context.rejections.len())
        })
    };
    let remover = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            runtime
                .run_cycle(vec![advance("shared", LifecycleEvent::Deregister)])
                .await
                .map(|run| run.context.rejections.len())
        })
    };
    let walker_rejections = walker.await.unwrap().unwrap();
    let remover_rejections = remover.await.unwrap().unwrap();

    // Deregister is legal from every active state, so it always lands.
    assert_eq!(remover_rejections, 0);
    let agent = runtime.lifecycle().query("shared").unwrap();
    assert_eq!(agent.state, AgentState::Inactive);

    let path: Vec<(AgentState, AgentState)> =
        agent.transitions.iter().map(|t| (t.from, t.to)).collect();
    let observe_first = vec![
        (AgentState::Registered, AgentState::Idle),
        (AgentState::Idle, AgentState::Observing),
        (AgentState::Observing, AgentState::Inactive),
    ];
    let deregister_first = vec![
        (AgentState::Registered, AgentState::Idle),
        (AgentState::Idle, AgentState::Inactive),
    ];
    if walker_rejections == 0 {
        assert_eq!(path, observe_first);
    } else {
        assert_eq!(path, deregister_first);
    }
}
