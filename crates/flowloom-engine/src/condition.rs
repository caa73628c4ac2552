//! Edge selection.
//!
//! `choose_edge` applies the rules below in order and the first one that
//! produces an edge wins:
//!
//! 1. a single outgoing edge is taken unconditionally;
//! 2. the first edge whose label is a true `name OP literal` comparison;
//! 3. an edge labeled `else`;
//! 4. if any label *looks* conditional, stop: no edge;
//! 5. metadata `checkVar`/`checkPath`, matched by label containment;
//! 6. a node label of the form `if <var>[:<path>] is <value>`;
//! 7. a node label of the form `check <var>[:<path>]`;
//! 8. the first outgoing edge.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use flowloom_core::definition::{Edge, Node};
use flowloom_core::vars::StoreVars;

const TRUTHY: &[&str] = &["true", "yes", "y", "1"];
const FALSEY: &[&str] = &["false", "no", "n", "0"];

/// Comparison operator accepted in edge labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    StrictEq,
    StrictNe,
    LooseEq,
    LooseNe,
    Le,
    Ge,
    Lt,
    Gt,
}

impl CompareOp {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "===" => Self::StrictEq,
            "!==" => Self::StrictNe,
            "==" => Self::LooseEq,
            "!=" => Self::LooseNe,
            "<=" => Self::Le,
            ">=" => Self::Ge,
            "<" => Self::Lt,
            ">" => Self::Gt,
            _ => return None,
        })
    }

    fn is_relational(self) -> bool {
        matches!(self, Self::Le | Self::Ge | Self::Lt | Self::Gt)
    }
}

/// Right-hand side of a comparison, typed by textual sniffing.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Bool(bool),
    Null,
    Number(f64),
    Str(String),
}

impl Literal {
    /// Quoted text stays a string; otherwise booleans, null and numbers are
    /// recognized before falling back to the raw text.
    pub fn sniff(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(inner) = strip_quotes(raw) {
            return Self::Str(inner.to_string());
        }
        match raw.to_ascii_lowercase().as_str() {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            "null" | "undefined" | "none" => return Self::Null,
            _ => {}
        }
        match raw.parse::<f64>() {
            Ok(n) if n.is_finite() => Self::Number(n),
            _ => Self::Str(raw.to_string()),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Str(s) => s.trim().parse().ok(),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Null => None,
        }
    }
}

/// A parsed `name OP literal` edge label.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    /// Variable reference, `var` or `var:path`.
    pub name: String,
    pub op: CompareOp,
    pub literal: Literal,
}

impl Comparison {
    /// Parse an edge label. A leading `if` and wrapping parentheses are
    /// tolerated.
    pub fn parse(label: &str) -> Option<Self> {
        let caps = comparison_re().captures(label)?;
        Some(Self {
            name: caps[1].to_string(),
            op: CompareOp::parse(&caps[2])?,
            literal: Literal::sniff(&caps[3]),
        })
    }

    pub fn evaluate(&self, vars: &StoreVars) -> bool {
        let actual = vars.resolve(&self.name).filter(|v| !v.is_null());

        if self.op.is_relational() || matches!(self.literal, Literal::Number(_)) {
            let lhs = actual.and_then(to_number);
            let rhs = self.literal.as_number();
            return match (lhs, rhs) {
                (Some(a), Some(b)) => match self.op {
                    CompareOp::Lt => a < b,
                    CompareOp::Gt => a > b,
                    CompareOp::Le => a <= b,
                    CompareOp::Ge => a >= b,
                    CompareOp::StrictEq | CompareOp::LooseEq => a == b,
                    CompareOp::StrictNe | CompareOp::LooseNe => a != b,
                },
                _ => matches!(self.op, CompareOp::StrictNe | CompareOp::LooseNe),
            };
        }

        let strict = matches!(self.op, CompareOp::StrictEq | CompareOp::StrictNe);
        let equal = match &self.literal {
            Literal::Null => actual.is_none(),
            Literal::Bool(b) if strict => actual.and_then(Value::as_bool) == Some(*b),
            Literal::Bool(b) => actual.and_then(loose_bool) == Some(*b),
            Literal::Str(s) if strict => actual.and_then(Value::as_str) == Some(s.as_str()),
            Literal::Str(s) => actual.map(value_text).as_deref() == Some(s.as_str()),
            // Numeric literals take the branch above.
            Literal::Number(_) => false,
        };

        match self.op {
            CompareOp::StrictNe | CompareOp::LooseNe => !equal,
            _ => equal,
        }
    }
}

/// Whether a label reads like a branch condition.
pub fn looks_conditional(label: &str) -> bool {
    let label = label.trim();
    label.eq_ignore_ascii_case("else")
        || label.to_ascii_lowercase().starts_with("if ")
        || comparison_re().is_match(label)
}

/// Pick the single edge to follow out of a node, or `None` to stop.
pub fn choose_edge<'a>(edges: &[&'a Edge], vars: &StoreVars, node: &Node) -> Option<&'a Edge> {
    // 1. Single edge
    if edges.len() == 1 {
        return Some(edges[0]);
    }
    if edges.is_empty() {
        return None;
    }

    // 2. Comparison labels
    for edge in edges {
        if let Some(cmp) = Comparison::parse(edge.label_text()) {
            if cmp.evaluate(vars) {
                debug!(node_id = %node.id, edge_id = %edge.id, "Edge condition matched");
                return Some(edge);
            }
        }
    }

    // 3. Else
    if let Some(edge) = edges
        .iter()
        .find(|e| e.label_text().eq_ignore_ascii_case("else"))
    {
        debug!(node_id = %node.id, edge_id = %edge.id, "Falling through to else edge");
        return Some(edge);
    }

    // 4. Conditional intent without a match stops the branch
    if edges.iter().any(|e| looks_conditional(e.label_text())) {
        debug!(node_id = %node.id, "No condition matched and no else edge, stopping branch");
        return None;
    }

    // 5. Explicit checkVar
    if let Some((var, path)) = node.check_var() {
        let wanted = vars
            .get_path(var, path)
            .map(value_text)
            .map(|s| s.trim().to_lowercase())
            .unwrap_or_default();
        if !wanted.is_empty() {
            if let Some(edge) = edges
                .iter()
                .find(|e| e.label_text().to_lowercase().contains(&wanted))
            {
                return Some(edge);
            }
        }
    }

    let label = node.display_label();

    // 6. "if <var> is <value>"
    if let Some(caps) = if_is_re().captures(label) {
        let actual = resolve_parts(vars, &caps[1], caps.get(2).map(|m| m.as_str()));
        let expected = strip_quotes(caps[3].trim())
            .unwrap_or(caps[3].trim())
            .to_lowercase();
        if let Some((truthy, falsey)) = truthy_falsey_pair(edges) {
            let matched = match synonym_class(&expected) {
                Some(class) => actual.and_then(truth_class) == Some(class),
                None => actual
                    .map(|v| value_text(v).to_lowercase())
                    .is_some_and(|a| !a.is_empty() && a.contains(&expected)),
            };
            return Some(if matched { truthy } else { falsey });
        }
        let actual_text = actual
            .map(|v| value_text(v).trim().to_lowercase())
            .unwrap_or_default();
        if !actual_text.is_empty() {
            if let Some(edge) = edges
                .iter()
                .find(|e| e.label_text().to_lowercase().contains(&actual_text))
            {
                return Some(edge);
            }
        }
    }

    // 7. "check <var>"
    if let Some(caps) = check_re().captures(label) {
        let exists = resolve_parts(vars, &caps[1], caps.get(2).map(|m| m.as_str())).is_some();
        if let Some((truthy, falsey)) = truthy_falsey_pair(edges) {
            return Some(if exists { truthy } else { falsey });
        }
    }

    // 8. Fallback
    edges.first().copied()
}

fn comparison_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*(?i:if\s+)?\(?\s*([A-Za-z_$][\w$.:\-]*)\s*(===|!==|==|!=|<=|>=|<|>)\s*(.+?)\s*\)?\s*$",
        )
        .expect("static comparison regex")
    })
}

fn if_is_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*if\s+([\w$.\-]+)(?::([\w$.\-]+))?\s+is\s+(.+?)\s*\??\s*$")
            .expect("static if-is regex")
    })
}

fn check_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*check\s+([\w$.\-]+)(?::([\w$.\-]+))?\s*\??\s*$")
            .expect("static check regex")
    })
}

fn resolve_parts<'v>(vars: &'v StoreVars, var: &str, path: Option<&str>) -> Option<&'v Value> {
    vars.get_path(var, path).filter(|v| !v.is_null())
}

fn strip_quotes(raw: &str) -> Option<&str> {
    ['"', '\'', '`'].iter().find_map(|q| {
        raw.strip_prefix(*q)
            .and_then(|rest| rest.strip_suffix(*q))
    })
}

/// The (truthy, falsey) edges when there are exactly two edges labeled with
/// one synonym of each kind.
fn truthy_falsey_pair<'a>(edges: &[&'a Edge]) -> Option<(&'a Edge, &'a Edge)> {
    if edges.len() != 2 {
        return None;
    }
    let a = synonym_class(&edges[0].label_text().to_lowercase())?;
    let b = synonym_class(&edges[1].label_text().to_lowercase())?;
    match (a, b) {
        (true, false) => Some((edges[0], edges[1])),
        (false, true) => Some((edges[1], edges[0])),
        _ => None,
    }
}

fn synonym_class(text: &str) -> Option<bool> {
    let text = text.trim();
    if TRUTHY.contains(&text) {
        Some(true)
    } else if FALSEY.contains(&text) {
        Some(false)
    } else {
        None
    }
}

fn truth_class(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|n| n != 0.0),
        Value::String(s) => synonym_class(&s.to_lowercase()).or(Some(!s.trim().is_empty())),
        Value::Null => Some(false),
        Value::Array(_) | Value::Object(_) => Some(true),
    }
}

fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn loose_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|n| n != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Text form used for loose string comparison and containment.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> StoreVars {
        let mut vars = StoreVars::new();
        for (k, v) in pairs {
            vars.set(k, v.clone());
        }
        vars
    }

    fn pick<'a>(edges: &'a [Edge], vars: &StoreVars, node: &Node) -> Option<&'a str> {
        let refs: Vec<&Edge> = edges.iter().collect();
        choose_edge(&refs, vars, node).map(|e| e.id.as_str())
    }

    #[test]
    fn test_parse_comparison() {
        let cmp = Comparison::parse("x === 1").unwrap();
        assert_eq!(cmp.name, "x");
        assert_eq!(cmp.op, CompareOp::StrictEq);
        assert_eq!(cmp.literal, Literal::Number(1.0));

        let cmp = Comparison::parse("if (status != 'done')").unwrap();
        assert_eq!(cmp.op, CompareOp::LooseNe);
        assert_eq!(cmp.literal, Literal::Str("done".into()));

        let cmp = Comparison::parse("order:total>=10.5").unwrap();
        assert_eq!(cmp.name, "order:total");
        assert_eq!(cmp.op, CompareOp::Ge);

        assert!(Comparison::parse("else").is_none());
        assert!(Comparison::parse("go to the next step").is_none());
    }

    #[test]
    fn test_literal_sniffing() {
        assert_eq!(Literal::sniff("TRUE"), Literal::Bool(true));
        assert_eq!(Literal::sniff("undefined"), Literal::Null);
        assert_eq!(Literal::sniff("-3"), Literal::Number(-3.0));
        assert_eq!(Literal::sniff("\"3\""), Literal::Str("3".into()));
        assert_eq!(Literal::sniff("pending"), Literal::Str("pending".into()));
    }

    #[test]
    fn test_numeric_coercion() {
        let v = vars(&[("count", json!("7"))]);
        assert!(Comparison::parse("count > 5").unwrap().evaluate(&v));
        assert!(Comparison::parse("count === 7").unwrap().evaluate(&v));
        assert!(!Comparison::parse("count < 7").unwrap().evaluate(&v));
        // Missing values never satisfy a numeric comparison but do satisfy `!=`.
        assert!(!Comparison::parse("absent >= 0").unwrap().evaluate(&v));
        assert!(Comparison::parse("absent != 0").unwrap().evaluate(&v));
    }

    #[test]
    fn test_strict_vs_loose() {
        let v = vars(&[("flag", json!("true")), ("name", json!("ada")), ("n", json!(5))]);
        assert!(!Comparison::parse("flag === true").unwrap().evaluate(&v));
        assert!(Comparison::parse("flag == true").unwrap().evaluate(&v));
        assert!(Comparison::parse("name === 'ada'").unwrap().evaluate(&v));
        assert!(Comparison::parse("n == '5'").unwrap().evaluate(&v));
        assert!(!Comparison::parse("n === '5'").unwrap().evaluate(&v));
        assert!(Comparison::parse("missing === null").unwrap().evaluate(&v));
        assert!(Comparison::parse("name !== null").unwrap().evaluate(&v));
    }

    #[test]
    fn test_single_edge_is_unconditional() {
        let edges = vec![Edge::labeled("e1", "a", "b", "x === 1")];
        assert_eq!(pick(&edges, &StoreVars::new(), &Node::new("a")), Some("e1"));
        let edges = vec![Edge::labeled("e1", "a", "b", "else")];
        assert_eq!(pick(&edges, &StoreVars::new(), &Node::new("a")), Some("e1"));
    }

    #[test]
    fn test_first_true_condition_wins() {
        let edges = vec![
            Edge::labeled("low", "a", "b", "x < 10"),
            Edge::labeled("mid", "a", "c", "x < 100"),
            Edge::labeled("other", "a", "d", "else"),
        ];
        let node = Node::new("a");
        assert_eq!(pick(&edges, &vars(&[("x", json!(50))]), &node), Some("mid"));
        assert_eq!(pick(&edges, &vars(&[("x", json!(5))]), &node), Some("low"));
        assert_eq!(pick(&edges, &vars(&[("x", json!(500))]), &node), Some("other"));
    }

    #[test]
    fn test_absent_var_falls_to_else() {
        let edges = vec![
            Edge::labeled("yes", "a", "b", "a===true"),
            Edge::labeled("no", "a", "c", "ELSE"),
        ];
        assert_eq!(pick(&edges, &StoreVars::new(), &Node::new("a")), Some("no"));
    }

    #[test]
    fn test_conditional_labels_without_match_stop() {
        let edges = vec![
            Edge::labeled("e1", "a", "b", "x === 1"),
            Edge::labeled("e2", "a", "c", "x === 2"),
        ];
        assert_eq!(pick(&edges, &vars(&[("x", json!(3))]), &Node::new("a")), None);

        let edges = vec![
            Edge::labeled("e1", "a", "b", "if the customer is new"),
            Edge::labeled("e2", "a", "c", "otherwise"),
        ];
        assert_eq!(pick(&edges, &StoreVars::new(), &Node::new("a")), None);
    }

    #[test]
    fn test_check_var_metadata() {
        let edges = vec![
            Edge::labeled("e1", "a", "b", "Route to Sales"),
            Edge::labeled("e2", "a", "c", "Route to Support"),
        ];
        let node = Node::new("a")
            .with_metadata("checkVar", json!("ticket"))
            .with_metadata("checkPath", json!("team"));
        let v = vars(&[("ticket", json!({"team": "  SUPPORT "}))]);
        assert_eq!(pick(&edges, &v, &node), Some("e2"));
    }

    #[test]
    fn test_if_is_label_with_synonyms() {
        let edges = vec![
            Edge::labeled("no", "a", "c", "No"),
            Edge::labeled("yes", "a", "b", "Yes"),
        ];
        let node = Node::new("a").with_label("If approved is true");
        assert_eq!(pick(&edges, &vars(&[("approved", json!(true))]), &node), Some("yes"));
        assert_eq!(pick(&edges, &vars(&[("approved", json!("no"))]), &node), Some("no"));

        let node = Node::new("a").with_label("if order:state is shipped");
        let v = vars(&[("order", json!({"state": "Shipped (partial)"}))]);
        assert_eq!(pick(&edges, &v, &node), Some("yes"));
    }

    #[test]
    fn test_if_is_label_matches_edge_text() {
        let edges = vec![
            Edge::labeled("red", "a", "b", "red path"),
            Edge::labeled("blue", "a", "c", "blue path"),
        ];
        let node = Node::new("a").with_label("If color is anything");
        assert_eq!(pick(&edges, &vars(&[("color", json!("Blue"))]), &node), Some("blue"));
    }

    #[test]
    fn test_check_label_branches_on_existence() {
        let edges = vec![
            Edge::labeled("y", "a", "b", "y"),
            Edge::labeled("n", "a", "c", "n"),
        ];
        let node = Node::new("a").with_label("Check user:email");
        assert_eq!(pick(&edges, &vars(&[("user", json!({"email": "a@b.c"}))]), &node), Some("y"));
        assert_eq!(pick(&edges, &vars(&[("user", json!({}))]), &node), Some("n"));
    }

    #[test]
    fn test_fallback_first_edge() {
        let edges = vec![
            Edge::new("first", "a", "b"),
            Edge::labeled("second", "a", "c", "next"),
        ];
        assert_eq!(pick(&edges, &StoreVars::new(), &Node::new("a")), Some("first"));
        assert_eq!(pick(&[], &StoreVars::new(), &Node::new("a")), None);
    }
}
