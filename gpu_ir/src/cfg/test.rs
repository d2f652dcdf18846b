use super::EdgeKind;
use crate::program::Program;
use crate::source::ShaderKind;

fn diamond() -> (Program, [super::BlockId; 4]) {
    let mut p = Program::new(ShaderKind::Vertex);
    let e = p.entry();
    let a = p.new_block().unwrap();
    let b = p.new_block().unwrap();
    let m = p.new_block().unwrap();
    p.attach_edge(e, a, EdgeKind::Forward);
    p.attach_edge(e, b, EdgeKind::Forward);
    p.attach_edge(a, m, EdgeKind::Forward);
    p.attach_edge(b, m, EdgeKind::Forward);
    (p, [e, a, b, m])
}

#[test]
fn pass_order_visits_each_block_once() {
    let (mut p, [e, a, b, m]) = diamond();
    let order = p.pass_order(e);
    assert_eq!(order.len(), 4);
    assert_eq!(order[0], e);
    for bb in [a, b, m] {
        assert_eq!(order.iter().filter(|&&x| x == bb).count(), 1);
    }
}

#[test]
fn pass_order_does_not_descend_back_edges() {
    let mut p = Program::new(ShaderKind::Vertex);
    let e = p.entry();
    let h = p.new_block().unwrap();
    let body = p.new_block().unwrap();
    p.attach_edge(e, h, EdgeKind::LoopEnter);
    p.attach_edge(h, body, EdgeKind::Forward);
    p.attach_edge(body, h, EdgeKind::Back);
    let order = p.pass_order(e);
    assert_eq!(order, vec![e, h, body]);
}

#[test]
fn emission_defers_loop_exit_behind_the_body() {
    let mut p = Program::new(ShaderKind::Vertex);
    let e = p.entry();
    let h = p.new_block().unwrap();
    let body = p.new_block().unwrap();
    let tail = p.new_block().unwrap();
    let exit = p.new_block().unwrap();
    p.attach_edge(e, h, EdgeKind::LoopEnter);
    p.attach_edge(h, body, EdgeKind::Forward);
    p.attach_edge(body, tail, EdgeKind::Forward);
    p.attach_edge(tail, h, EdgeKind::Back);
    p.attach_edge_ex(body, exit, EdgeKind::Fake, EdgeKind::LoopLeave);
    let order = p.emission_order(e);
    assert_eq!(order.len(), 5);
    let pos =
        |b| order.iter().position(|&x| x == b).unwrap();
    assert!(pos(h) < pos(body));
    assert!(pos(body) < pos(exit));
    assert!(pos(tail) < pos(exit));
}

#[test]
fn merge_is_dominated_by_the_branch_only() {
    let (p, [e, a, _, m]) = diamond();
    assert!(p.dominated_by(m, e));
    assert!(!p.dominated_by(m, a));
    assert!(p.dominated_by(a, e));
    assert!(p.dominated_by(m, m));
}

#[test]
fn dominance_ignores_back_edges() {
    let mut p = Program::new(ShaderKind::Vertex);
    let e = p.entry();
    let h = p.new_block().unwrap();
    let body = p.new_block().unwrap();
    p.attach_edge(e, h, EdgeKind::LoopEnter);
    p.attach_edge(h, body, EdgeKind::Forward);
    p.attach_edge(body, h, EdgeKind::Back);
    assert!(p.dominated_by(body, h));
    assert!(p.dominated_by(h, e));
}

#[test]
fn reachability_respects_the_terminator_block() {
    let mut p = Program::new(ShaderKind::Vertex);
    let e = p.entry();
    let a = p.new_block().unwrap();
    let m = p.new_block().unwrap();
    p.attach_edge(e, a, EdgeKind::Forward);
    p.attach_edge(a, m, EdgeKind::Forward);
    assert!(p.reachable_by(m, e, None));
    assert!(!p.reachable_by(m, e, Some(a)));
    assert!(!p.reachable_by(e, a, None));
}
