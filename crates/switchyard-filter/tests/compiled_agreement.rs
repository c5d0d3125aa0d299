//! Property tests: compiled programs agree with the reference interpreter.
//!
//! Random documents are checked against a fixed corpus of queries, compiled
//! both on their own and in inverse mode, and against a filter table holding
//! many boolean filters at once.

use std::collections::HashSet;

use proptest::prelude::*;
use switchyard_core::{Document, DocumentBuilder};
use switchyard_filter::{
    parse, CompileMode, FilterError, FilterId, FilterTable, Interpreter, Query, QueryOptions,
    Value, WorkCounter, MAX_PREDICATE_DEPTH,
};

const QUERIES: &[&str] = &[
    "count(//a)",
    "//a[@id = 1]",
    "/root/a[2]",
    "/root/*[last()]",
    "//a[b]/@id",
    "//*[position() = 2]",
    "//a[last()]",
    "//a[1][b = 'y']",
    "//a[position() < 3][b]",
    "count(//b[a[c]])",
    "//a[b[c[@id > 1]]]",
    "sum(//@id)",
    "//b[. = 'x' or @id = 2]",
    "//a[not(c) and @id != 3]",
    "//*[@id = 1 or @id = 2 or c]",
    "string(//c[1])",
    "//a/following-sibling::b[1]",
    "//b/preceding-sibling::*[2]",
    "//c/ancestor::*[@id]",
    "//a/ancestor-or-self::*[1]",
    "//b/parent::*",
    "count(//a | //b)",
    "(//a | //c)[2]",
    "//a[count(*) > 1]",
    "concat(name(/*), '-', count(//c))",
    "//*[starts-with(., 'x')]",
    "//a[contains(., '1')]",
    "/root/a = 1",
    "//b != 'x'",
    "//a = //b",
    "//*[@id div 2 = 1]",
    "-count(//a) + 5 mod 3",
    "number(//a[1]/@id) + 1",
    "string-length(string(//b[1])) * 2",
    "normalize-space(string(/root))",
    "local-name(//c)",
    "boolean(//a[@id = 1][c])",
    "//a[.//c = 'x']",
    "descendant::b[@id >= 2]",
    "//a[c][1]/self::a",
    "/root/a = 'x' and /root/b or count(//c) = 2",
];

const FILTERS: &[&str] = &[
    "/root/a = 1",
    "/root/a = 2",
    "/root/a = 'x'",
    "/root/a = 'x' or /root/b",
    "/root/a = 2 and /root/c",
    "not(/root/a = 1)",
    "//b[@id = 1]",
    "//b[@id = 2]",
    "//b[@id = 2][c]",
    "count(//c) > 1",
    "/root/*[2] = 'y'",
    "/root/a[@id = 3] = 1",
    "starts-with(/root/b, 'x')",
    "/root",
];

#[derive(Debug, Clone)]
struct Tree {
    name: &'static str,
    id: Option<u8>,
    text: &'static str,
    children: Vec<Tree>,
}

fn tree_strategy() -> impl Strategy<Value = Tree> {
    let name = prop_oneof![Just("a"), Just("b"), Just("c")];
    let text = prop_oneof![Just(""), Just("1"), Just("2"), Just("x"), Just("y")];
    let leaf = (name.clone(), proptest::option::of(0u8..4), text.clone()).prop_map(
        |(name, id, text)| Tree {
            name,
            id,
            text,
            children: Vec::new(),
        },
    );
    leaf.prop_recursive(3, 24, 4, move |inner| {
        (
            name.clone(),
            proptest::option::of(0u8..4),
            text.clone(),
            proptest::collection::vec(inner, 0..4),
        )
            .prop_map(|(name, id, text, children)| Tree {
                name,
                id,
                text,
                children,
            })
    })
}

fn build(builder: DocumentBuilder, tree: &Tree) -> DocumentBuilder {
    let id = tree.id.map(|id| id.to_string());
    let attributes: Vec<(&str, &str)> = id.iter().map(|v| ("id", v.as_str())).collect();
    let mut builder = builder.start(tree.name, &attributes);
    if !tree.text.is_empty() {
        builder = builder.text(tree.text);
    }
    for child in &tree.children {
        builder = build(builder, child);
    }
    builder.end()
}

fn document(children: &[Tree]) -> Document {
    let mut builder = DocumentBuilder::new().start("root", &[]);
    for child in children {
        builder = build(builder, child);
    }
    builder.end().finish()
}

fn same(left: &Result<Value, FilterError>, right: &Result<Value, FilterError>) -> bool {
    match (left, right) {
        (Ok(Value::Number(l)), Ok(Value::Number(r))) => l == r || (l.is_nan() && r.is_nan()),
        (Ok(l), Ok(r)) => l == r,
        (Err(_), Err(_)) => true,
        _ => false,
    }
}

fn compiled(mode: CompileMode) -> Vec<Query> {
    let options = QueryOptions {
        mode,
        ..QueryOptions::default()
    };
    QUERIES
        .iter()
        .map(|src| {
            Query::compile_with(src, options).unwrap_or_else(|e| panic!("compile {src}: {e}"))
        })
        .collect()
}

fn filter_table() -> FilterTable<usize> {
    let mut table = FilterTable::new();
    for (i, src) in FILTERS.iter().enumerate() {
        table
            .add(src, i)
            .unwrap_or_else(|e| panic!("add {src}: {e}"));
    }
    table
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn compiled_queries_agree_with_the_interpreter(
        children in proptest::collection::vec(tree_strategy(), 0..4)
    ) {
        let doc = document(&children);
        let forward = compiled(CompileMode::Forward);
        let inverse = compiled(CompileMode::Inverse);
        let counter = WorkCounter::unbounded();

        for (i, src) in QUERIES.iter().enumerate() {
            let expr = parse(src).unwrap_or_else(|e| panic!("parse {src}: {e}"));
            counter.reset();
            let expected = Interpreter::new(&doc, &counter).evaluate(&expr);
            let forward_result = forward[i].evaluate_value(&doc);
            let inverse_result = inverse[i].evaluate_value(&doc);
            prop_assert!(
                same(&expected, &forward_result),
                "{src}: interpreter {expected:?}, forward {forward_result:?}"
            );
            prop_assert!(
                same(&expected, &inverse_result),
                "{src}: interpreter {expected:?}, inverse {inverse_result:?}"
            );
        }
    }

    #[test]
    fn filter_table_agrees_with_individual_filters(
        children in proptest::collection::vec(tree_strategy(), 0..4)
    ) {
        let doc = document(&children);
        let table = filter_table();
        let matched = table.matching_ids(&doc, None).unwrap();

        let mut expected = HashSet::new();
        for (i, src) in FILTERS.iter().enumerate() {
            let query = Query::compile(src).unwrap_or_else(|e| panic!("compile {src}: {e}"));
            if query.evaluate(&doc).unwrap() {
                expected.insert(FilterId(i as u32));
            }
        }
        prop_assert_eq!(matched, expected);
    }
}

#[test]
fn predicates_nest_up_to_the_maximum_depth() {
    assert_eq!(MAX_PREDICATE_DEPTH, 3);
    assert!(Query::compile("a[b[c[d]]]").is_ok());
    assert!(parse("a[b[c[d[e]]]]").is_ok());
    assert_eq!(
        Query::compile("a[b[c[d[e]]]]").map(|_| ()),
        Err(FilterError::PredicateDepthExceeded { max: 3 })
    );
    let inverse = QueryOptions {
        mode: CompileMode::Inverse,
        ..QueryOptions::default()
    };
    assert_eq!(
        Query::compile_with("a[1][b[c[2]]]", inverse).map(|_| ()),
        Ok(())
    );
    assert_eq!(
        Query::compile_with("a[b[c[d[1]]]]", inverse).map(|_| ()),
        Err(FilterError::PredicateDepthExceeded { max: 3 })
    );
}

#[test]
fn the_merged_program_is_smaller_than_its_parts() {
    let table = filter_table();
    let separate: usize = FILTERS
        .iter()
        .map(|src| Query::compile(src).map(|q| q.program().len()).unwrap_or(0))
        .sum();
    assert!(table.program().len() < separate);
}
