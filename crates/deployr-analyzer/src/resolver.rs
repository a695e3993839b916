//! Minimal-closure dependency resolution over a scanner's symbol maps.
//! Text-based and best-effort: unresolved symbols are dropped silently,
//! and the walk is hard-capped to stay linear on dense call graphs.

use std::collections::{HashMap, HashSet, VecDeque};

use regex::Regex;
use tracing::{debug, trace};

use deployr_common::{AnalysisResult, Route};

/// Hard bound on resolved symbols per closure. Guarantees termination on
/// cyclic or densely-connected call graphs; completeness is traded away
/// above this size.
pub const MAX_RESOLVED_SYMBOLS: usize = 50;

/// Symbols never treated as user dependencies: language builtins and
/// keywords, framework helpers, SQL tokens that show up inside string
/// literals, and column-name style identifiers that are overwhelmingly
/// false positives. A user symbol that collides with this list is not
/// resolved (known false-negative source).
const DENY_LIST: &[&str] = &[
    // Python builtins
    "abs", "all", "any", "ascii", "bin", "bool", "bytearray", "bytes", "callable", "chr",
    "classmethod", "compile", "complex", "delattr", "dict", "dir", "divmod", "enumerate", "eval",
    "exec", "filter", "float", "format", "frozenset", "getattr", "globals", "hasattr", "hash",
    "help", "hex", "id", "input", "int", "isinstance", "issubclass", "iter", "len", "list",
    "locals", "map", "max", "memoryview", "min", "next", "object", "oct", "open", "ord", "pow",
    "print", "property", "range", "repr", "reversed", "round", "set", "setattr", "slice",
    "sorted", "staticmethod", "str", "sum", "super", "tuple", "type", "vars", "zip",
    // keywords that the call regex can trip over
    "if", "else", "elif", "for", "while", "try", "except", "finally", "with", "as", "def",
    "class", "return", "yield", "import", "from", "global", "nonlocal", "lambda", "pass",
    "break", "continue", "in", "and", "or", "not", "is",
    // framework helpers
    "jsonify", "request", "make_response", "redirect", "abort", "render_template", "url_for",
    "session",
    // SQL tokens embedded in query strings
    "select", "insert", "update", "delete", "where", "values", "order", "group", "having",
    "join", "inner", "left", "right", "outer", "distinct", "count", "avg", "union", "limit",
    "offset", "create", "drop", "alter", "table", "index", "primary", "key", "foreign",
    "references", "null", "default", "unique",
    // column-name style identifiers
    "users", "user", "name", "email", "password", "books", "book", "title", "created_at",
    "updated_at", "data", "value", "status", "category",
];

const PRIMITIVE_TYPES: &[&str] = &[
    "str", "int", "float", "bool", "bytes", "dict", "list", "set", "tuple", "object", "Any",
    "Optional", "List", "Dict", "Set", "Tuple", "None",
];

enum Resolution {
    Source(String),
    SourcelessServiceCall(String),
    Unresolved,
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedClosure {
    pub dependencies: HashSet<String>,
    pub dependency_sources: HashMap<String, String>,
    pub model_types: HashSet<String>,
}

pub struct DependencyResolver<'a> {
    analysis: &'a AnalysisResult,
    re_call: Regex,
    re_attr_call: Regex,
    re_param_type: Regex,
    re_return_type: Regex,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(analysis: &'a AnalysisResult) -> Self {
        let re = |p: &str| Regex::new(p).expect("static regex");
        Self {
            analysis,
            re_call: re(r"\b([A-Za-z_]\w*)\s*\("),
            re_attr_call: re(r"\b([A-Za-z_]\w*)\.([A-Za-z_]\w*)\s*\("),
            re_param_type: re(r"[(,]\s*\w+\s*:\s*([A-Za-z_]\w*)"),
            re_return_type: re(r"->\s*([A-Za-z_]\w*)"),
        }
    }

    /// Compute the minimal closure for one route. The visited state is
    /// local to this call and never shared across routes.
    pub fn resolve(&self, route: &Route) -> ResolvedClosure {
        let mut closure = ResolvedClosure::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();

        for candidate in self.candidates_in(&route.source) {
            if seen.insert(candidate.clone()) {
                queue.push_back(candidate);
            }
        }
        if let Some(calls) = self.analysis.call_graph.get(&route.name) {
            for candidate in calls {
                if seen.insert(candidate.clone()) {
                    queue.push_back(candidate.clone());
                }
            }
        }

        while let Some(symbol) = queue.pop_front() {
            if closure.dependencies.len() >= MAX_RESOLVED_SYMBOLS {
                debug!(
                    route = %route.name,
                    cap = MAX_RESOLVED_SYMBOLS,
                    "Closure bound reached, dropping remaining candidates"
                );
                break;
            }
            if symbol == route.name || is_denied(&symbol) {
                continue;
            }

            match self.resolve_symbol(&symbol) {
                Resolution::Source(source) => {
                    closure.dependencies.insert(symbol.clone());
                    closure.dependency_sources.insert(symbol, source.clone());
                    for candidate in self.candidates_in(&source) {
                        if seen.insert(candidate.clone()) {
                            queue.push_back(candidate);
                        }
                    }
                }
                Resolution::SourcelessServiceCall(method) => {
                    // The receiver is a known service field but its class
                    // source is unavailable. Keep the dependency so the
                    // synthesizer can render a stub instead of crashing.
                    if !is_denied(&method) {
                        debug!(%method, "Service call without resolvable source kept for stubbing");
                        closure.dependencies.insert(method);
                    }
                }
                Resolution::Unresolved => {
                    trace!(%symbol, "Unresolved symbol dropped");
                }
            }
        }

        self.add_owned_services(route, &mut closure);
        self.add_model_dependencies(route, &mut closure);
        closure
    }

    fn candidates_in(&self, source: &str) -> Vec<String> {
        let mut candidates = Vec::new();
        for caps in self.re_call.captures_iter(source) {
            candidates.push(caps[1].to_string());
        }
        for caps in self.re_attr_call.captures_iter(source) {
            candidates.push(format!("{}.{}", &caps[1], &caps[2]));
        }
        candidates
    }

    /// A plain name resolves against the scanner's function map. An
    /// `object.method` reference resolves either as a fully-qualified
    /// entry or through an owned-service field.
    fn resolve_symbol(&self, symbol: &str) -> Resolution {
        if let Some(source) = self.analysis.functions.get(symbol) {
            return Resolution::Source(source.clone());
        }
        if let Some((receiver, method)) = symbol.split_once('.') {
            if let Some(service_type) = self.analysis.owned_services.get(receiver) {
                return match self.lookup_class(service_type) {
                    Some((_, src)) => Resolution::Source(src.clone()),
                    None => Resolution::SourcelessServiceCall(method.to_string()),
                };
            }
        }
        Resolution::Unresolved
    }

    /// Exact name match first; otherwise prefer the class whose name
    /// exactly suffixes the requested type name.
    fn lookup_class(&self, type_name: &str) -> Option<(&String, &String)> {
        if let Some(entry) = self.analysis.classes.get_key_value(type_name) {
            return Some(entry);
        }
        let mut suffix_matches: Vec<(&String, &String)> = self
            .analysis
            .classes
            .iter()
            .filter(|(name, _)| name.ends_with(&format!(".{type_name}")))
            .collect();
        suffix_matches.sort_by(|a, b| a.0.cmp(b.0));
        suffix_matches.into_iter().next()
    }

    /// Route-declared service fields are included wholesale. Partial class
    /// extraction is unsafe when fields and constructors are shared.
    fn add_owned_services(&self, route: &Route, closure: &mut ResolvedClosure) {
        for (field, service_type) in &self.analysis.owned_services {
            if !word_present(field, &route.source) {
                continue;
            }
            if let Some((class_name, class_source)) = self.lookup_class(service_type) {
                let key = format!("class:{class_name}");
                debug!(service = %class_name, "Including owned service class wholesale");
                closure.dependencies.insert(key.clone());
                closure.dependency_sources.insert(key, class_source.clone());
            }
        }
    }

    /// Parameter and return type annotations that name a known class and
    /// are neither primitives nor deny-listed become model dependencies.
    fn add_model_dependencies(&self, route: &Route, closure: &mut ResolvedClosure) {
        let Some(signature) = route
            .source
            .lines()
            .find(|line| line.trim_start().starts_with("def "))
        else {
            return;
        };

        let mut type_names: Vec<String> = Vec::new();
        for caps in self.re_param_type.captures_iter(signature) {
            type_names.push(caps[1].to_string());
        }
        for caps in self.re_return_type.captures_iter(signature) {
            type_names.push(caps[1].to_string());
        }

        for type_name in type_names {
            if PRIMITIVE_TYPES.contains(&type_name.as_str()) || is_denied(&type_name) {
                continue;
            }
            if !type_name.starts_with(|c: char| c.is_ascii_uppercase()) {
                continue;
            }
            if let Some((class_name, class_source)) = self.lookup_class(&type_name) {
                let key = format!("model:{class_name}");
                closure.model_types.insert(class_name.clone());
                closure.dependencies.insert(key.clone());
                closure.dependency_sources.insert(key, class_source.clone());
            }
        }
    }
}

fn is_denied(symbol: &str) -> bool {
    let lowered = symbol.to_lowercase();
    DENY_LIST.contains(&symbol) || DENY_LIST.contains(&lowered.as_str())
}

fn word_present(symbol: &str, source: &str) -> bool {
    Regex::new(&format!(r"\b{}\b", regex::escape(symbol)))
        .map(|re| re.is_match(source))
        .unwrap_or_else(|_| source.contains(symbol))
}

#[cfg(test)]
mod tests {
    use super::*;
    use deployr_common::{Framework, Language};

    fn route(name: &str, source: &str) -> Route {
        Route {
            name: name.into(),
            path: format!("/{name}"),
            methods: vec!["GET".into()],
            source: source.into(),
            app_name: "app".into(),
            class_name: None,
            namespace: None,
            file_path: None,
        }
    }

    fn base_analysis() -> AnalysisResult {
        AnalysisResult {
            language: Language::Python,
            framework: Framework::Flask,
            app_name: "app".into(),
            ..Default::default()
        }
    }

    #[test]
    fn resolves_transitive_dependencies() {
        let mut analysis = base_analysis();
        analysis.functions.insert(
            "load".into(),
            "def load():\n    return parse('x')".into(),
        );
        analysis
            .functions
            .insert("parse".into(), "def parse(raw):\n    return raw".into());

        let resolver = DependencyResolver::new(&analysis);
        let closure = resolver.resolve(&route("handler", "def handler():\n    return load()"));

        assert!(closure.dependencies.contains("load"));
        assert!(closure.dependencies.contains("parse"));
        assert_eq!(closure.dependency_sources.len(), 2);
    }

    #[test]
    fn cyclic_call_graphs_terminate_at_the_bound() {
        let mut analysis = base_analysis();
        // 60 functions in a ring, each calling the next.
        for i in 0..60 {
            let next = (i + 1) % 60;
            analysis.functions.insert(
                format!("step_{i}"),
                format!("def step_{i}():\n    return step_{next}()"),
            );
        }

        let resolver = DependencyResolver::new(&analysis);
        let closure = resolver.resolve(&route("entry", "def entry():\n    return step_0()"));

        assert_eq!(closure.dependencies.len(), MAX_RESOLVED_SYMBOLS);
    }

    #[test]
    fn deny_listed_symbols_are_never_resolved() {
        let mut analysis = base_analysis();
        // A user function that collides with a builtin name loses.
        analysis
            .functions
            .insert("filter".into(), "def filter(x):\n    return x".into());
        analysis
            .functions
            .insert("shape".into(), "def shape(x):\n    return x".into());

        let resolver = DependencyResolver::new(&analysis);
        let closure = resolver.resolve(&route(
            "handler",
            "def handler():\n    return filter(shape(1))",
        ));

        assert!(!closure.dependencies.contains("filter"));
        assert!(closure.dependencies.contains("shape"));
    }

    #[test]
    fn sql_keywords_inside_literals_are_ignored() {
        let analysis = base_analysis();
        let resolver = DependencyResolver::new(&analysis);
        let closure = resolver.resolve(&route(
            "handler",
            "def handler():\n    cur.execute(\"SELECT (id) FROM users WHERE (name)\")",
        ));
        assert!(closure.dependencies.is_empty());
    }

    #[test]
    fn owned_service_fields_pull_in_the_whole_class() {
        let mut analysis = base_analysis();
        analysis
            .owned_services
            .insert("repo".into(), "BookRepository".into());
        analysis.classes.insert(
            "BookRepository".into(),
            "class BookRepository:\n    def find_all(self):\n        return []".into(),
        );

        let resolver = DependencyResolver::new(&analysis);
        let closure = resolver.resolve(&route(
            "handler",
            "def handler():\n    return repo.find_all()",
        ));

        assert!(closure.dependencies.contains("class:BookRepository"));
        assert!(closure.dependency_sources["class:BookRepository"].contains("find_all"));
    }

    #[test]
    fn class_lookup_prefers_exact_suffix() {
        let mut analysis = base_analysis();
        analysis
            .owned_services
            .insert("svc".into(), "OrderService".into());
        analysis.classes.insert(
            "billing.OrderService".into(),
            "class OrderService:\n    pass  # billing".into(),
        );
        analysis.classes.insert(
            "billing.MajorOrderService".into(),
            "class MajorOrderService:\n    pass".into(),
        );

        let resolver = DependencyResolver::new(&analysis);
        let closure = resolver.resolve(&route("handler", "def handler():\n    return svc.place()"));

        assert!(closure
            .dependencies
            .contains("class:billing.OrderService"));
        assert!(!closure
            .dependencies
            .iter()
            .any(|d| d.contains("MajorOrderService")));
    }

    #[test]
    fn model_types_come_from_signature_annotations() {
        let mut analysis = base_analysis();
        analysis.classes.insert(
            "Book".into(),
            "class Book:\n    def __init__(self, title):\n        self.title = title".into(),
        );

        let resolver = DependencyResolver::new(&analysis);
        let closure = resolver.resolve(&route(
            "add_book",
            "def add_book(payload: Book) -> dict:\n    return vars(payload)",
        ));

        assert!(closure.model_types.contains("Book"));
        assert!(closure.dependencies.contains("model:Book"));
    }

    #[test]
    fn service_call_without_class_source_is_kept_for_stubbing() {
        let mut analysis = base_analysis();
        // The field is declared but its class lives outside the app.
        analysis
            .owned_services
            .insert("payments".into(), "PaymentService".into());

        let resolver = DependencyResolver::new(&analysis);
        let closure = resolver.resolve(&route(
            "charge_card",
            "def charge_card():\n    return payments.charge(10)",
        ));

        assert!(closure.dependencies.contains("charge"));
        assert!(!closure.dependency_sources.contains_key("charge"));
    }

    #[test]
    fn unresolved_symbols_are_dropped_silently() {
        let analysis = base_analysis();
        let resolver = DependencyResolver::new(&analysis);
        let closure = resolver.resolve(&route(
            "handler",
            "def handler():\n    return mystery_helper(1)",
        ));
        assert!(closure.dependencies.is_empty());
        assert!(closure.dependency_sources.is_empty());
    }
}
