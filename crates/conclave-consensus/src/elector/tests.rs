use super::*;

fn name(s: &str) -> NodeName {
    NodeName::from(s)
}

fn cluster() -> Vec<NodeName> {
    ["Alpha", "Beta", "Gamma", "Delta"]
        .iter()
        .map(|n| name(n))
        .collect()
}

fn electors() -> Vec<PrimaryElector> {
    let all = cluster();
    all.iter()
        .map(|n| PrimaryElector::new(n.clone(), &all, 2))
        .collect()
}

/// Delivers every broadcast election message to every other elector
/// until the whole group is quiescent.
fn run_to_quiescence(electors: &mut [PrimaryElector]) {
    loop {
        let mut deliveries: Vec<(usize, ElectionMsg, NodeName)> = Vec::new();
        for (i, elector) in electors.iter_mut().enumerate() {
            while let Some(out) = elector.outbox.pop_front() {
                if let ElectorOutMsg::Send(msg) = out {
                    for j in 0..4 {
                        if j != i {
                            deliveries.push((j, msg.clone(), elector.node_name.clone()));
                        }
                    }
                }
            }
        }
        if deliveries.is_empty() {
            break;
        }
        for (j, msg, from) in deliveries {
            electors[j].inbox.push_back((msg, from));
        }
        for elector in electors.iter_mut() {
            elector.service_queues(usize::MAX);
        }
    }
}

fn decisions(elector: &PrimaryElector, inst: InstId) -> Option<NodeName> {
    elector.decided_primary(inst).cloned()
}

#[test]
fn expected_primary_is_rank_of_view_plus_instance() {
    let elector = PrimaryElector::new(name("Alpha"), &cluster(), 2);
    assert_eq!(elector.expected_primary(InstId::MASTER), &name("Alpha"));
    assert_eq!(elector.expected_primary(InstId::new(1)), &name("Beta"));
}

#[test]
fn all_nodes_agree_on_primaries() {
    let mut group = electors();
    for elector in &mut group {
        elector.decide_primaries();
    }
    run_to_quiescence(&mut group);

    for elector in &group {
        assert_eq!(decisions(elector, InstId::MASTER), Some(name("Alpha")));
        assert_eq!(decisions(elector, InstId::new(1)), Some(name("Beta")));
    }
}

#[test]
fn view_change_rotates_the_primaries() {
    let mut group = electors();
    for elector in &mut group {
        elector.decide_primaries();
    }
    run_to_quiescence(&mut group);

    for elector in &mut group {
        elector.on_view_change(ViewNo::new(1));
        // Drop the PrimaryDecided events of view 0
        elector.outbox.retain(|m| matches!(m, ElectorOutMsg::Send(_)));
    }
    run_to_quiescence(&mut group);

    for elector in &group {
        assert_eq!(elector.view_no(), ViewNo::new(1));
        assert_eq!(decisions(elector, InstId::MASTER), Some(name("Beta")));
        assert_eq!(decisions(elector, InstId::new(1)), Some(name("Gamma")));
    }
}

#[test]
fn duplicate_nomination_raises_suspicion() {
    let mut elector = PrimaryElector::new(name("Alpha"), &cluster(), 1);
    elector.decide_primaries();
    elector.outbox.clear();

    let nom = Nomination {
        name: name("Alpha"),
        inst_id: InstId::MASTER,
        view_no: ViewNo::ZERO,
    };
    elector
        .inbox
        .push_back((ElectionMsg::Nomination(nom.clone()), name("Beta")));
    elector
        .inbox
        .push_back((ElectionMsg::Nomination(nom), name("Beta")));
    elector.service_queues(usize::MAX);

    let suspicious = elector.outbox.iter().any(|m| {
        matches!(
            m,
            ElectorOutMsg::Suspicion(s)
                if s.node == name("Beta") && s.code == SuspicionCode::DuplicateNomSent
        )
    });
    assert!(suspicious);
}

#[test]
fn stale_view_messages_are_discarded_and_future_ones_stashed() {
    let mut elector = PrimaryElector::new(name("Alpha"), &cluster(), 1);
    elector.on_view_change(ViewNo::new(1));
    elector.outbox.clear();

    // A vote for the settled view 0 is dead
    let stale = Nomination {
        name: name("Beta"),
        inst_id: InstId::MASTER,
        view_no: ViewNo::ZERO,
    };
    elector
        .inbox
        .push_back((ElectionMsg::Nomination(stale), name("Beta")));
    elector.service_queues(usize::MAX);
    assert!(elector.outbox.is_empty());

    // A vote for view 2 waits until this node gets there, then counts
    let future = Nomination {
        name: name("Gamma"),
        inst_id: InstId::MASTER,
        view_no: ViewNo::new(2),
    };
    elector
        .inbox
        .push_back((ElectionMsg::Nomination(future), name("Beta")));
    elector.service_queues(usize::MAX);
    assert!(elector.outbox.is_empty());

    elector.on_view_change(ViewNo::new(2));
    elector.service_queues(usize::MAX);
    let tallied = elector.elections[0]
        .nominations
        .get(&name("Gamma"))
        .is_some_and(|votes| votes.contains(&name("Beta")));
    assert!(tallied, "stashed nomination must tally after the view change");
}

#[test]
fn split_round_triggers_reelection_with_lexicographic_tiebreak() {
    let mut elector = PrimaryElector::new(name("Alpha"), &cluster(), 1);
    elector.decide_primaries();
    elector.outbox.clear();

    // Every peer nominates a different candidate: four nominators, top
    // vote count one, no quorum
    for peer in ["Beta", "Gamma", "Delta"] {
        elector.inbox.push_back((
            ElectionMsg::Nomination(Nomination {
                name: name(peer),
                inst_id: InstId::MASTER,
                view_no: ViewNo::ZERO,
            }),
            name(peer),
        ));
    }
    elector.service_queues(usize::MAX);

    let reelection = elector
        .outbox
        .iter()
        .find_map(|m| match m {
            ElectorOutMsg::Send(ElectionMsg::Reelection(r)) => Some(r.clone()),
            _ => None,
        })
        .expect("split round must broadcast a reelection");
    assert_eq!(reelection.round, 1);
    assert_eq!(reelection.tie_among.first(), Some(&name("Alpha")));
    elector.outbox.clear();

    // Quorum of reelection votes starts the new round nominating the
    // lexicographically smallest tied candidate
    for peer in ["Beta", "Gamma"] {
        elector.inbox.push_back((
            ElectionMsg::Reelection(reelection.clone()),
            name(peer),
        ));
    }
    elector.service_queues(usize::MAX);

    let renomination = elector.outbox.iter().find_map(|m| match m {
        ElectorOutMsg::Send(ElectionMsg::Nomination(nom)) => Some(nom.clone()),
        _ => None,
    });
    assert_eq!(renomination.map(|n| n.name), Some(name("Alpha")));
}

#[test]
fn lagged_peers_get_the_full_transcript() {
    let mut group = electors();
    for elector in &mut group {
        elector.decide_primaries();
    }
    run_to_quiescence(&mut group);

    let replay = group[0].election_messages_for_lagged();
    // One nomination and one primary per instance
    let nominations = replay
        .iter()
        .filter(|m| matches!(m, ElectionMsg::Nomination(_)))
        .count();
    let primaries = replay
        .iter()
        .filter(|m| matches!(m, ElectionMsg::Primary(_)))
        .count();
    assert_eq!(nominations, 2);
    assert_eq!(primaries, 2);
}
