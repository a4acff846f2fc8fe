//! Integration tests for policy text to `Policy` compilation.
//!
//! Tests verify:
//! - Connections and chains keep textual order
//! - Incidental whitespace does not change the compiled policy
//! - Field-identical flow literals share one query
//! - Parse failures carry a usable diagnostic

use policy_engine::{
    Chain, FlowMatcher, Policy, PolicyError, Prefix, Rule, INGRESS_PROBE,
};
use std::net::Ipv4Addr;

const EXAMPLE: &str = "1 -> 2\n2 -> 3\n(10.0.0.0/24, 0.0.0.0/0, 6, 80, 0):\n1 -> 2 -> 3\n";

fn addr(s: &str) -> u32 {
    u32::from(s.parse::<Ipv4Addr>().unwrap())
}

/// Connections as sorted `(src, dst)` pairs.
fn edges(policy: &Policy) -> Vec<(u32, u32)> {
    let mut out: Vec<_> = policy
        .connections()
        .iter()
        .flat_map(|(src, dsts)| dsts.iter().map(move |dst| (*src, *dst)))
        .collect();
    out.sort();
    out
}

// ============================================================================
// ORDER AND SHAPE
// ============================================================================

#[test]
fn test_example_policy() {
    let policy = Policy::parse(EXAMPLE).unwrap();
    assert_eq!(edges(&policy), vec![(1, 2), (2, 3)]);
    assert_eq!(policy.queries().len(), 1);

    let query = &policy.queries()[0];
    assert_eq!(query.matcher.src, Prefix::parse("10.0.0.0/24").unwrap());
    assert_eq!(query.matcher.src.mask, 0xFFFF_FF00);
    assert_eq!(query.chains, vec![Chain::new(vec![1, 2, 3])]);
    assert_eq!(query.chains[0].head(), Some(1));
    assert_eq!(query.chains[0].tail(), Some(3));
}

#[test]
fn test_checks_keep_declaration_order() {
    let text = "1 -> 2\n\
                (10.2.0.0/16, 0.0.0.0/0, 6, 0, 0): 4 -> 5\n\
                (10.1.0.0/16, 0.0.0.0/0, 6, 0, 0): 1 -> 2\n\
                (10.2.0.0/16, 0.0.0.0/0, 6, 0, 0): 6 -> 7 -> 8 -> 9\n";
    let policy = Policy::parse(text).unwrap();

    let sources: Vec<String> = policy
        .queries()
        .iter()
        .map(|q| q.matcher.src.to_string())
        .collect();
    assert_eq!(sources, vec!["10.2.0.0/16", "10.1.0.0/16"]);
    assert_eq!(
        policy.queries()[0].chains,
        vec![Chain::new(vec![4, 5]), Chain::new(vec![6, 7, 8, 9])]
    );
    assert_eq!(policy.chain_count(), 3);
}

#[test]
fn test_whitespace_does_not_change_policy() {
    let compact = "1->2 2->3(10.0.0.0/24,0.0.0.0/0,6,80,0):1->2->3\n";
    let spaced = "\n\n  1  ->  2\r\n\t2 ->\n3\n\n(10.0.0.0/24 , 0.0.0.0/0 ,\n6, 80 , 0 )\n:\n\t1 ->\n 2\n->   3\n";

    let a = Policy::parse(compact).unwrap();
    let b = Policy::parse(spaced).unwrap();
    assert_eq!(edges(&a), edges(&b));
    assert_eq!(a.queries(), b.queries());
    assert_eq!(a.to_string(), b.to_string());
    assert_ne!(a.digest(), b.digest());
}

#[test]
fn test_textually_distinct_equal_flows_share_query() {
    let text = "1 -> 2\n\
                (10.0.0.0/24, 0.0.0.0/0, 6, 80, 0): 1 -> 2\n\
                (10.0.0.200/24, 0.0.0.0/0, 06, 0080, 0): 2 -> 3\n";
    let policy = Policy::parse(text).unwrap();
    assert_eq!(policy.queries().len(), 1);

    let matcher = policy.queries()[0].matcher;
    assert_eq!(policy.chains_for(&matcher).map(<[Chain]>::len), Some(2));
}

#[test]
fn test_host_and_cidr_matching() {
    let policy = Policy::parse(
        "1 -> 2\n\
         (10.0.0.5, 0.0.0.0/0, 17, 0, 0): 1 -> 2\n\
         (10.0.0.0/24, 0.0.0.0/0, 6, 0, 0): 2 -> 3\n",
    )
    .unwrap();

    let host: &FlowMatcher = &policy.queries()[0].matcher;
    assert!(host.selects(addr("10.0.0.5")));
    assert!(!host.selects(addr("10.0.0.6")));

    let net = &policy.queries()[1].matcher;
    assert!(net.selects(addr("10.0.0.5")));
    assert!(!net.selects(addr("10.0.1.5")));

    // Host literal is declared first, so it wins for 10.0.0.5.
    assert_eq!(policy.select(addr("10.0.0.5")).map(|q| q.matcher), Some(*host));
    assert_eq!(policy.select(addr("10.0.0.9")).map(|q| q.matcher), Some(*net));
    assert!(policy.select(addr("192.168.0.1")).is_none());
}

#[test]
fn test_ingress_chain() {
    let policy =
        Policy::parse("0 -> 1\n(10.0.0.0/8, 0.0.0.0/0, 6, 0, 0): 0 -> 1 -> 2\n").unwrap();
    let chain = &policy.queries()[0].chains[0];
    assert!(chain.starts_at_ingress());
    assert_eq!(chain.head(), Some(INGRESS_PROBE));
}

#[test]
fn test_canonical_form_reparses() {
    let policy = Policy::parse(EXAMPLE).unwrap();
    let again = Policy::parse(&policy.to_string()).unwrap();
    assert_eq!(policy.queries(), again.queries());
    assert_eq!(edges(&policy), edges(&again));
}

// ============================================================================
// FAILURES
// ============================================================================

#[test]
fn test_syntax_error_diagnostic() {
    let text = "1 -> 2\n(10.0.0.0/24, 0.0.0.0/0, 6, 80, 0): 1 -> 2 -> x\n";
    match Policy::parse(text) {
        Err(PolicyError::Syntax(err)) => {
            assert_eq!(err.rule, Rule::Probe);
            assert_eq!(err.end.line, 2);
            assert_eq!(err.found, Some('x'));
            assert!(err.to_string().starts_with("parse error near "));
            assert!(err.to_string().contains("line 2 symbol"));
        }
        other => panic!("expected syntax error, got {:?}", other),
    }
}

#[test]
fn test_policy_without_connections_fails() {
    let err = Policy::parse("(10.0.0.0/24, 0.0.0.0/0, 6, 80, 0): 1 -> 2\n").unwrap_err();
    assert!(matches!(err, PolicyError::Syntax(_)));
}

#[test]
fn test_check_requires_trailing_newline() {
    let err = Policy::parse("1 -> 2\n(10.0.0.0/24, 0.0.0.0/0, 6, 80, 0): 1 -> 2").unwrap_err();
    match err {
        PolicyError::Syntax(err) => assert_eq!(err.found, None),
        other => panic!("expected syntax error, got {:?}", other),
    }
}

#[test]
fn test_out_of_range_protocol_is_invalid_literal() {
    let err = Policy::parse("1 -> 2\n(10.0.0.0/24, 0.0.0.0/0, 300, 80, 0): 1 -> 2\n").unwrap_err();
    match err {
        PolicyError::InvalidLiteral { rule, text, .. } => {
            assert_eq!(rule, Rule::Probe);
            assert_eq!(text, "300");
        }
        other => panic!("expected InvalidLiteral, got {:?}", other),
    }
}

#[test]
fn test_load_missing_file() {
    let err = Policy::load("/nonexistent/path/policy.txt").unwrap_err();
    assert!(matches!(err, PolicyError::Io { .. }));
}
