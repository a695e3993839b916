//! Reference scanner for Python Flask applications. Best-effort textual
//! analysis: route decorators, module imports, the call graph, environment
//! variable references, globals and database bootstrap blocks. The
//! heuristics are documented trade-offs, not a promise of full semantic
//! resolution.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use regex::Regex;
use tracing::{debug, info, warn};

use deployr_common::{
    AnalysisResult, DeployrError, Framework, Function, ImportBinding, Language, Result, Route,
};

use crate::resolver::DependencyResolver;
use crate::ApplicationAnalyzer;

/// Import module prefixes every generated function keeps regardless of
/// direct usage, because the runtime shim depends on them.
const ESSENTIAL_MODULE_PREFIXES: [&str; 3] = ["flask", "werkzeug", "jinja2"];

const DB_SIGNATURES: [&str; 10] = [
    "conn.",
    "cursor()",
    "psycopg2",
    "connect(",
    "rollback()",
    "commit()",
    "execute(",
    "fetchone()",
    "DATABASE_URL",
    "RealDictCursor",
];

pub struct FlaskAnalyzer {
    re_flask_app: Regex,
    re_blueprint: Regex,
    re_import: Regex,
    re_from_import: Regex,
    re_def: Regex,
    re_class: Regex,
    re_route_decorator: Regex,
    re_methods_kwarg: Regex,
    re_method_literal: Regex,
    re_env_getenv: Regex,
    re_env_environ_get: Regex,
    re_env_environ_index: Regex,
    re_global_var: Regex,
    re_config_line: Regex,
    re_service_field: Regex,
}

impl Default for FlaskAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl FlaskAnalyzer {
    pub fn new() -> Self {
        // All patterns are static literals; compilation cannot fail.
        let re = |p: &str| Regex::new(p).expect("static regex");
        Self {
            re_flask_app: re(r"(?m)^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=\s*Flask\s*\("),
            re_blueprint: re(r"(?m)^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(?:\w+\.)?Blueprint\s*\("),
            re_import: re(r"(?m)^\s*import\s+(.+?)\s*$"),
            re_from_import: re(r"(?m)^\s*from\s+([\w.]+)\s+import\s+(.+?)\s*$"),
            re_def: re(r"(?m)^([ \t]*)def\s+([A-Za-z_]\w*)\s*\("),
            re_class: re(r"(?m)^([ \t]*)class\s+([A-Za-z_]\w*)"),
            re_route_decorator: re(r#"@([A-Za-z_]\w*)\.route\(\s*['"]([^'"]+)['"]"#),
            re_methods_kwarg: re(r"methods\s*=\s*\[([^\]]*)\]"),
            re_method_literal: re(r#"['"]([A-Za-z]+)['"]"#),
            re_env_getenv: re(r#"os\.getenv\(\s*['"]([^'"]+)['"]"#),
            re_env_environ_get: re(r#"os\.environ\.get\(\s*['"]([^'"]+)['"]"#),
            re_env_environ_index: re(r#"os\.environ\[\s*['"]([^'"]+)['"]\s*\]"#),
            re_global_var: re(r"(?m)^([A-Z][A-Z0-9_]*)\s*=\s*\S"),
            re_config_line: re(r#"(?m)^\s*\w+\.config\[\s*['"]([^'"]+)['"]\s*\]\s*=.*$"#),
            re_service_field: re(r"(?m)^([a-z_][A-Za-z0-9_]*)\s*=\s*([A-Z]\w*)\s*\("),
        }
    }

    /// Module-level `field = SomeService()` assignments. The declared type
    /// feeds owned-service resolution in the dependency resolver.
    fn collect_owned_services(&self, source: &str, owned: &mut HashMap<String, String>) {
        for caps in self.re_service_field.captures_iter(source) {
            let class_name = caps[2].to_string();
            if matches!(class_name.as_str(), "Flask" | "Blueprint" | "SQLAlchemy") {
                continue;
            }
            owned.insert(caps[1].to_string(), class_name);
        }
    }

    fn python_files(&self, app_path: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for entry in WalkBuilder::new(app_path).build().flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "py") {
                files.push(path.to_path_buf());
            }
        }
        files.sort();
        files
    }

    fn collect_imports(&self, source: &str, imports: &mut HashMap<String, ImportBinding>) {
        for caps in self.re_import.captures_iter(source) {
            for part in caps[1].split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let (module, alias) = match part.split_once(" as ") {
                    Some((m, a)) => (m.trim().to_string(), a.trim().to_string()),
                    None => (part.to_string(), part.to_string()),
                };
                imports.insert(alias.clone(), ImportBinding::new(module, alias));
            }
        }
        for caps in self.re_from_import.captures_iter(source) {
            let module = caps[1].to_string();
            for part in caps[2].split(',') {
                let part = part.trim();
                if part.is_empty() || part == "*" {
                    continue;
                }
                let (name, alias) = match part.split_once(" as ") {
                    Some((n, a)) => (n.trim().to_string(), a.trim().to_string()),
                    None => (part.to_string(), part.to_string()),
                };
                imports.insert(
                    alias.clone(),
                    ImportBinding::new(format!("{module}.{name}"), alias),
                );
            }
        }
    }

    /// Extract an indentation-delimited block starting at `start_line`,
    /// including any decorator lines immediately above it.
    fn extract_block(&self, lines: &[&str], start_line: usize, base_indent: usize) -> String {
        let mut first = start_line;
        while first > 0 {
            let prev = lines[first - 1].trim_start();
            if prev.starts_with('@') && indent_of(lines[first - 1]) == base_indent {
                first -= 1;
            } else {
                break;
            }
        }

        let mut last = start_line;
        for (idx, line) in lines.iter().enumerate().skip(start_line + 1) {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                last = idx;
                continue;
            }
            if indent_of(line) <= base_indent {
                break;
            }
            last = idx;
        }

        lines[first..=last].join("\n")
    }

    fn collect_functions(
        &self,
        source: &str,
        functions: &mut HashMap<String, String>,
        call_graph: &mut HashMap<String, HashSet<String>>,
    ) {
        let lines: Vec<&str> = source.lines().collect();
        let re_call = Regex::new(r"\b([A-Za-z_]\w*)\s*\(").expect("static regex");
        let re_attr_call = Regex::new(r"\b([A-Za-z_]\w*)\.([A-Za-z_]\w*)\s*\(").expect("static regex");

        for caps in self.re_def.captures_iter(source) {
            let whole = caps.get(0).unwrap();
            let indent = caps[1].len();
            let name = caps[2].to_string();
            let line_idx = source[..whole.start()].matches('\n').count();
            let body = self.extract_block(&lines, line_idx, indent);

            let mut calls = HashSet::new();
            for call in re_call.captures_iter(&body) {
                let callee = call[1].to_string();
                if callee != name {
                    calls.insert(callee);
                }
            }
            for call in re_attr_call.captures_iter(&body) {
                calls.insert(format!("{}.{}", &call[1], &call[2]));
            }

            debug!(function = %name, call_count = calls.len(), "Scanned function definition");
            call_graph.insert(name.clone(), calls);
            functions.insert(name, body);
        }
    }

    fn collect_classes(&self, source: &str, classes: &mut HashMap<String, String>) {
        let lines: Vec<&str> = source.lines().collect();
        for caps in self.re_class.captures_iter(source) {
            let whole = caps.get(0).unwrap();
            let indent = caps[1].len();
            if indent > 0 {
                continue; // nested classes stay with their parent block
            }
            let name = caps[2].to_string();
            let line_idx = source[..whole.start()].matches('\n').count();
            let body = self.extract_block(&lines, line_idx, indent);
            classes.insert(name, body);
        }
    }

    fn collect_routes(
        &self,
        source: &str,
        file_path: &str,
        app_symbols: &HashSet<String>,
        functions: &HashMap<String, String>,
        routes: &mut Vec<Route>,
    ) {
        let lines: Vec<&str> = source.lines().collect();
        for caps in self.re_def.captures_iter(source) {
            let whole = caps.get(0).unwrap();
            let indent = caps[1].len();
            let name = caps[2].to_string();
            let line_idx = source[..whole.start()].matches('\n').count();

            // Decorators sit directly above the def at the same indent.
            let mut decorator_lines = Vec::new();
            let mut cursor = line_idx;
            while cursor > 0 {
                let prev = lines[cursor - 1];
                if prev.trim_start().starts_with('@') && indent_of(prev) == indent {
                    decorator_lines.push(prev);
                    cursor -= 1;
                } else {
                    break;
                }
            }

            for decorator in decorator_lines {
                let Some(route_caps) = self.re_route_decorator.captures(decorator) else {
                    continue;
                };
                let app_var = &route_caps[1];
                if !app_symbols.contains(app_var) {
                    continue;
                }
                let path = route_caps[2].to_string();
                let methods = self.methods_from_decorator(decorator);

                let Some(body) = functions.get(&name) else {
                    warn!(route = %name, "Route decorator found but function body missing");
                    continue;
                };
                routes.push(Route {
                    name: name.clone(),
                    path,
                    methods,
                    source: body.clone(),
                    app_name: app_var.to_string(),
                    class_name: None,
                    namespace: None,
                    file_path: Some(file_path.to_string()),
                });
            }
        }
    }

    fn methods_from_decorator(&self, decorator: &str) -> Vec<String> {
        if let Some(caps) = self.re_methods_kwarg.captures(decorator) {
            let methods: Vec<String> = self
                .re_method_literal
                .captures_iter(&caps[1])
                .map(|m| m[1].to_uppercase())
                .collect();
            if !methods.is_empty() {
                return methods;
            }
        }
        vec!["GET".to_string()]
    }

    fn collect_env_vars(&self, source: &str, env_vars: &mut HashSet<String>) {
        for re in [
            &self.re_env_getenv,
            &self.re_env_environ_get,
            &self.re_env_environ_index,
        ] {
            for caps in re.captures_iter(source) {
                env_vars.insert(caps[1].to_string());
            }
        }
    }

    fn collect_module_level_blocks(
        &self,
        source: &str,
        global_vars: &mut HashMap<String, String>,
        config_code: &mut HashMap<String, String>,
        db_code: &mut HashMap<String, String>,
    ) {
        for caps in self.re_global_var.captures_iter(source) {
            let name = caps[1].to_string();
            let line_idx = source[..caps.get(0).unwrap().start()].matches('\n').count();
            if let Some(line) = source.lines().nth(line_idx) {
                global_vars.insert(name, line.to_string());
            }
        }
        for caps in self.re_config_line.captures_iter(source) {
            config_code.insert(caps[1].to_string(), caps[0].to_string());
        }
        for line in source.lines() {
            let trimmed = line.trim();
            if indent_of(line) == 0
                && (trimmed.contains(".connect(") || trimmed.contains("SQLAlchemy("))
            {
                if let Some((name, _)) = trimmed.split_once('=') {
                    db_code.insert(name.trim().to_string(), line.to_string());
                }
            }
        }
    }

    fn requires_db(&self, source: &str) -> bool {
        DB_SIGNATURES.iter().any(|sig| source.contains(sig))
    }

    fn imports_used_by(
        &self,
        analysis: &AnalysisResult,
        sources: &[&str],
    ) -> Vec<ImportBinding> {
        let mut used = Vec::new();
        for binding in analysis.imports.values() {
            let essential = ESSENTIAL_MODULE_PREFIXES
                .iter()
                .any(|prefix| binding.module.to_lowercase().starts_with(prefix));
            let referenced = sources
                .iter()
                .any(|source| symbol_used(&binding.alias, source));
            if essential || referenced || binding.alias == analysis.app_name {
                used.push(binding.clone());
            }
        }
        used.sort_by(|a, b| a.module.cmp(&b.module));
        used.dedup();
        used
    }
}

impl ApplicationAnalyzer for FlaskAnalyzer {
    fn language(&self) -> Language {
        Language::Python
    }

    fn framework(&self) -> Framework {
        Framework::Flask
    }

    fn detect(&self, app_path: &Path) -> bool {
        self.python_files(app_path).iter().any(|file| {
            fs::read_to_string(file)
                .map(|content| content.contains("Flask("))
                .unwrap_or(false)
        })
    }

    fn analyze(&self, app_path: &Path) -> Result<AnalysisResult> {
        if !app_path.is_dir() {
            return Err(DeployrError::validation(
                "app_path",
                format!("Not a directory: {}", app_path.display()),
            ));
        }

        let files = self.python_files(app_path);
        if files.is_empty() {
            return Err(DeployrError::CodeAnalysis {
                language: "python".into(),
                message: format!("No Python files found under {}", app_path.display()),
            });
        }
        info!(files = files.len(), path = %app_path.display(), "Analyzing Flask application");

        let mut analysis = AnalysisResult {
            language: Language::Python,
            framework: Framework::Flask,
            app_name: "app".to_string(),
            ..Default::default()
        };
        let mut app_symbols: HashSet<String> = HashSet::new();

        // First pass: locate Flask app and blueprint bindings everywhere.
        let mut contents = Vec::with_capacity(files.len());
        for file in &files {
            let source = fs::read_to_string(file)
                .map_err(|e| DeployrError::file_op("read", file.display().to_string(), e))?;
            for caps in self.re_flask_app.captures_iter(&source) {
                app_symbols.insert(caps[1].to_string());
            }
            for caps in self.re_blueprint.captures_iter(&source) {
                app_symbols.insert(caps[1].to_string());
            }
            contents.push((file.clone(), source));
        }
        if let Some(app) = contents
            .iter()
            .find_map(|(_, s)| self.re_flask_app.captures(s).map(|c| c[1].to_string()))
        {
            analysis.app_name = app;
        }

        // Second pass: everything else.
        for (file, source) in &contents {
            let rel = file
                .strip_prefix(app_path)
                .unwrap_or(file)
                .display()
                .to_string();
            self.collect_imports(source, &mut analysis.imports);
            self.collect_functions(source, &mut analysis.functions, &mut analysis.call_graph);
            self.collect_classes(source, &mut analysis.classes);
            self.collect_routes(
                source,
                &rel,
                &app_symbols,
                &analysis.functions,
                &mut analysis.routes,
            );
            self.collect_env_vars(source, &mut analysis.env_var_refs);
            self.collect_owned_services(source, &mut analysis.owned_services);
            self.collect_module_level_blocks(
                source,
                &mut analysis.global_vars,
                &mut analysis.config_code,
                &mut analysis.db_code,
            );
        }

        info!(
            routes = analysis.routes.len(),
            functions = analysis.functions.len(),
            "Flask analysis complete"
        );
        Ok(analysis)
    }

    fn extract_functions(&self, analysis: &AnalysisResult) -> Result<Vec<Function>> {
        let resolver = DependencyResolver::new(analysis);
        let mut functions = Vec::with_capacity(analysis.routes.len());

        for route in &analysis.routes {
            let closure = resolver.resolve(route);
            let requires_db = self.requires_db(&route.source)
                || closure
                    .dependency_sources
                    .values()
                    .any(|source| self.requires_db(source));

            let mut sources: Vec<&str> = vec![route.source.as_str()];
            sources.extend(closure.dependency_sources.values().map(String::as_str));
            let imports = self.imports_used_by(analysis, &sources);

            let global_vars: HashMap<String, String> = analysis
                .global_vars
                .iter()
                .filter(|(name, _)| sources.iter().any(|s| symbol_used(name, s)))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            let function = Function {
                name: route.name.clone(),
                app_name: analysis.app_name.clone(),
                path: route.path.clone(),
                methods: if route.methods.is_empty() {
                    vec!["GET".to_string()]
                } else {
                    route.methods.clone()
                },
                source: route.source.clone(),
                dependencies: closure.dependencies.clone(),
                dependency_sources: closure.dependency_sources.clone(),
                imports,
                global_vars,
                db_code: if requires_db {
                    analysis.db_code.clone()
                } else {
                    HashMap::new()
                },
                config_code: analysis.config_code.clone(),
                env_vars: analysis.env_var_refs.clone(),
                requires_db,
                language: Language::Python,
                framework: Framework::Flask,
                ..Default::default()
            };
            functions.push(function);
        }

        Ok(functions)
    }
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Word-boundary occurrence check used for import and global filtering.
fn symbol_used(symbol: &str, source: &str) -> bool {
    Regex::new(&format!(r"\b{}\b", regex::escape(symbol)))
        .map(|re| re.is_match(source))
        .unwrap_or_else(|_| source.contains(symbol))
}
