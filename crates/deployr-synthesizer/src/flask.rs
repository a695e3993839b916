//! Synthesizer for Python Flask functions. Emits `main.py` with a fixed
//! section order, a merged `requirements.txt`, a Dockerfile and the
//! wrapper/adapter runtime shims, then runs the method fixer over the
//! emitted file.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::Path;

use ignore::WalkBuilder;
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use deployr_common::{
    DeployrError, Framework, Function, FunctionBuildContext, ImportBinding, Language, Result,
};

use crate::templates::{
    render, PYTHON_ADAPTER_TEMPLATE, PYTHON_DOCKERFILE_TEMPLATE, PYTHON_INIT_TEMPLATE,
    PYTHON_WRAPPER_TEMPLATE,
};
use crate::{fixer, FunctionSynthesizer};

const STANDARD_LIBRARY_MODULES: [&str; 24] = [
    "os", "sys", "json", "datetime", "math", "random", "time", "logging", "re", "collections",
    "itertools", "functools", "io", "csv", "unittest", "flask", "werkzeug", "requests", "urllib",
    "hashlib", "base64", "uuid", "threading", "tempfile",
];

/// Candidate entry files, probed in order, when detecting the original
/// Flask application variable.
const APP_ENTRY_FILES: [&str; 5] = ["app.py", "main.py", "server.py", "wsgi.py", "application.py"];

const ENV_FILES: [&str; 2] = [".env", ".flaskenv"];

pub struct FlaskSynthesizer {
    re_flask_var: Regex,
    re_path_param: Regex,
}

impl Default for FlaskSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

impl FlaskSynthesizer {
    pub fn new() -> Self {
        Self {
            re_flask_var: Regex::new(r"([A-Za-z_][A-Za-z0-9_]*)\s*=\s*Flask\s*\(")
                .expect("static regex"),
            re_path_param: Regex::new(r"<(?:[^:>]+:)?([^>]+)>").expect("static regex"),
        }
    }

    /// The original application's Flask variable name. Reusing it keeps
    /// intra-app aliasing (imports of the app object) working.
    fn detect_app_variable(&self, app_path: &Path) -> String {
        for filename in APP_ENTRY_FILES {
            let candidate = app_path.join(filename);
            let Ok(content) = fs::read_to_string(&candidate) else {
                continue;
            };
            if let Some(caps) = self.re_flask_var.captures(&content) {
                debug!(file = %candidate.display(), var = &caps[1], "Detected Flask app variable");
                return caps[1].to_string();
            }
        }
        "app".to_string()
    }

    fn build_main_source(&self, function: &Function, app_var: &str) -> String {
        let mut main = String::new();

        main.push_str("import os\nimport logging\nimport json\n");
        for import in &function.imports {
            main.push_str(&format_import(import));
            main.push('\n');
        }
        main.push('\n');

        main.push_str("logging.basicConfig(\n");
        main.push_str("    level=logging.INFO,\n");
        main.push_str("    format='%(asctime)s - %(name)s - %(levelname)s - %(message)s'\n");
        main.push_str(")\n");
        main.push_str("logger = logging.getLogger(__name__)\n\n");

        if !function.env_vars.is_empty() {
            let mut names: Vec<&str> = function.env_vars.iter().map(String::as_str).collect();
            names.sort_unstable();
            main.push_str("# Environment variables used by this function\n");
            main.push_str(&format!("# Variables: {}\n\n", names.join(", ")));
        }

        if !function.config_code.is_empty() {
            main.push_str("# Configuration blocks\n");
            for key in sorted_keys(&function.config_code) {
                main.push_str(&function.config_code[key]);
                main.push('\n');
            }
            main.push('\n');
        }

        if !function.global_vars.is_empty() {
            main.push_str("# Global variables\n");
            for key in sorted_keys(&function.global_vars) {
                main.push_str(&function.global_vars[key]);
                main.push('\n');
            }
            main.push('\n');
        }

        main.push_str(&format!("{app_var} = Flask(__name__)\n\n"));

        if !function.db_code.is_empty() {
            main.push_str("# Database initialization blocks\n");
            for key in sorted_keys(&function.db_code) {
                main.push_str(&function.db_code[key]);
                main.push_str("\n\n");
            }
        }

        if !function.dependencies.is_empty() {
            main.push_str("# --- Function dependencies ---\n");
            let ordered: BTreeSet<&String> = function.dependencies.iter().collect();
            for dep_name in ordered {
                match function.dependency_sources.get(dep_name.as_str()) {
                    Some(source) if !source.trim().is_empty() => {
                        main.push_str(&format!("# Dependency: {dep_name}\n"));
                        main.push_str(source);
                        main.push_str("\n\n");
                    }
                    _ => {
                        if dep_name.contains(':') || dep_name.contains('.') {
                            warn!(dependency = %dep_name, "No source for non-stubbable dependency, skipping");
                            continue;
                        }
                        warn!(dependency = %dep_name, "No source available, emitting stub");
                        main.push_str(&format!("# Stub for unresolved dependency: {dep_name}\n"));
                        main.push_str(&format!("def {dep_name}(*args, **kwargs):\n"));
                        main.push_str(&format!(
                            "    logger.warning(\"Stub for unresolved dependency {dep_name} called\")\n"
                        ));
                        main.push_str("    return args[0] if args else None\n\n");
                    }
                }
            }
            main.push_str("# --- End function dependencies ---\n\n");
        }

        if function.requires_db {
            self.append_database_bootstrap(&mut main, function);
        }

        main.push_str("# --- Route handler ---\n");
        let has_route_decorator = function.source.contains(&format!("@{app_var}.route("))
            || function.source.contains("@app.route(");
        if !has_route_decorator {
            let methods = function
                .methods
                .iter()
                .map(|m| format!("'{m}'"))
                .collect::<Vec<_>>()
                .join(", ");
            main.push_str(&format!(
                "@{app_var}.route('{}', methods=[{methods}])\n",
                function.path
            ));
        }
        main.push_str(&function.source);
        main.push('\n');

        main
    }

    fn append_database_bootstrap(&self, main: &mut String, function: &Function) {
        main.push_str("# --- Database connection setup ---\n");
        let uses_dotenv = function.source.contains("load_dotenv")
            || function.source.contains("getenv")
            || function.source.contains("DATABASE_URL");
        if uses_dotenv {
            main.push_str("load_dotenv()\n\n");
        }
        main.push_str("DATABASE_URL = os.getenv('DATABASE_URL')\n\n");
        main.push_str("if DATABASE_URL:\n");
        main.push_str("    conn = psycopg2.connect(DATABASE_URL, cursor_factory=RealDictCursor)\n");
        main.push_str("else:\n");
        main.push_str("    DB_HOST = os.getenv('DB_HOST')\n");
        main.push_str("    DB_PORT = os.getenv('DB_PORT', '5432')\n");
        main.push_str("    DB_NAME = os.getenv('DB_NAME', 'postgres')\n");
        main.push_str("    DB_USER = os.getenv('DB_USER', 'postgres')\n");
        main.push_str("    DB_PASSWORD = os.getenv('DB_PASSWORD')\n");
        main.push_str("    conn = psycopg2.connect(\n");
        main.push_str("        host=DB_HOST,\n");
        main.push_str("        port=DB_PORT,\n");
        main.push_str("        dbname=DB_NAME,\n");
        main.push_str("        user=DB_USER,\n");
        main.push_str("        password=DB_PASSWORD,\n");
        main.push_str("        cursor_factory=RealDictCursor\n");
        main.push_str("    )\n");
        main.push_str("# --- End database connection setup ---\n\n");
    }

    fn build_requirements(&self, function: &Function, app_path: &Path) -> String {
        let pins = common_python_packages();
        let mut requirements: HashSet<String> = HashSet::new();

        // Framework runtime floor.
        for pkg in ["flask", "werkzeug", "jinja2", "markupsafe", "itsdangerous", "click"] {
            requirements.insert(pins[pkg].to_string());
        }

        for import in &function.imports {
            let top_level = import.top_level_module();
            if is_standard_library(top_level) {
                continue;
            }
            let package = top_level.to_lowercase();
            if let Some(pin) = pins.get(package.as_str()) {
                requirements.insert(pin.to_string());
                if package == "boto3" {
                    requirements.insert(pins["botocore"].to_string());
                }
            } else if !is_local_module(top_level, app_path) {
                requirements.insert(top_level.to_string());
            }
        }

        // Pass through app-declared pins not already covered.
        let app_requirements = app_path.join("requirements.txt");
        if let Ok(content) = fs::read_to_string(&app_requirements) {
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let package = line
                    .split(['=', '<', '>', '~', '!'])
                    .next()
                    .unwrap_or(line)
                    .trim()
                    .to_lowercase();
                if !pins.contains_key(package.as_str()) {
                    requirements.insert(line.to_string());
                }
            }
        }

        let mut sorted: Vec<String> = requirements.into_iter().collect();
        sorted.sort_by_key(|a| a.to_lowercase());
        let mut manifest = sorted.join("\n");
        manifest.push('\n');
        manifest
    }

    fn function_args(&self, function: &Function) -> String {
        let args: Vec<String> = self
            .re_path_param
            .captures_iter(&function.path)
            .map(|caps| caps[1].trim().to_string())
            .filter(|arg| !arg.is_empty())
            .collect();
        args.join(", ")
    }

    fn write(&self, path: &Path, content: &str) -> Result<()> {
        fs::write(path, content)
            .map_err(|e| DeployrError::file_op("write", path.display().to_string(), e))
    }

    fn copy_env_files(&self, context: &FunctionBuildContext) -> Result<()> {
        for name in ENV_FILES {
            let source = context.source_app_path.join(name);
            if source.is_file() {
                let target = context.build_output_path.join(name);
                fs::copy(&source, &target)
                    .map_err(|e| DeployrError::file_op("copy", source.display().to_string(), e))?;
                debug!(file = name, "Copied environment file into build unit");
            }
        }
        Ok(())
    }

    /// Locally-defined modules referenced by the function's imports are
    /// copied beside the main file, preserving their directory shape.
    fn copy_local_modules(&self, context: &FunctionBuildContext) -> Result<()> {
        let app_path = &context.source_app_path;
        let build_path = &context.build_output_path;
        let mut copied = 0usize;

        let mut modules: BTreeSet<&str> = BTreeSet::new();
        for import in &context.function.imports {
            let top_level = import.top_level_module();
            if !is_standard_library(top_level) {
                modules.insert(top_level);
            }
        }

        for module in modules {
            let module_file = app_path.join(format!("{module}.py"));
            if module_file.is_file() {
                let target = build_path.join(format!("{module}.py"));
                fs::copy(&module_file, &target).map_err(|e| {
                    DeployrError::file_op("copy", module_file.display().to_string(), e)
                })?;
                copied += 1;
                continue;
            }

            let module_dir = app_path.join(module);
            if module_dir.is_dir() && module_dir.join("__init__.py").is_file() {
                for entry in WalkBuilder::new(&module_dir).build().flatten() {
                    let path = entry.path();
                    if !path.extension().is_some_and(|ext| ext == "py") {
                        continue;
                    }
                    let relative = path.strip_prefix(app_path).unwrap_or(path);
                    let target = build_path.join(relative);
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent).map_err(|e| {
                            DeployrError::file_op("create", parent.display().to_string(), e)
                        })?;
                    }
                    fs::copy(path, &target).map_err(|e| {
                        DeployrError::file_op("copy", path.display().to_string(), e)
                    })?;
                }
                copied += 1;
            }
        }

        if copied > 0 {
            info!(modules = copied, function = %context.function.name, "Copied local modules");
        }
        Ok(())
    }
}

impl FunctionSynthesizer for FlaskSynthesizer {
    fn language(&self) -> Language {
        Language::Python
    }

    fn framework(&self) -> Framework {
        Framework::Flask
    }

    #[instrument(skip(self, context), fields(function = %context.function.name))]
    fn create_build_unit(&self, context: &FunctionBuildContext) -> Result<()> {
        context.validate()?;
        let function = &context.function;
        let build_path = &context.build_output_path;

        fs::create_dir_all(build_path)
            .map_err(|e| DeployrError::file_op("create", build_path.display().to_string(), e))?;

        let app_var = self.detect_app_variable(&context.source_app_path);

        let main_source = self.build_main_source(function, &app_var);
        let main_path = build_path.join("main.py");
        self.write(&main_path, &main_source)?;

        let requirements = self.build_requirements(function, &context.source_app_path);
        self.write(&build_path.join("requirements.txt"), &requirements)?;

        let mut dockerfile_vars = HashMap::new();
        dockerfile_vars.insert("FUNCTION_NAME", function.name.clone());
        self.write(
            &build_path.join("Dockerfile"),
            &render(PYTHON_DOCKERFILE_TEMPLATE, &dockerfile_vars),
        )?;

        let mut wrapper_vars = HashMap::new();
        wrapper_vars.insert("APP_NAME", app_var.replace('-', "_"));
        wrapper_vars.insert("FUNCTION_NAME", function.name.clone());
        wrapper_vars.insert("FUNCTION_PATH", function.path.clone());
        wrapper_vars.insert("FUNCTION_ARGS", self.function_args(function));
        self.write(
            &build_path.join("function_wrapper.py"),
            &render(PYTHON_WRAPPER_TEMPLATE, &wrapper_vars),
        )?;

        let platform_dir = build_path.join("serverless_platform");
        fs::create_dir_all(&platform_dir)
            .map_err(|e| DeployrError::file_op("create", platform_dir.display().to_string(), e))?;
        self.write(&platform_dir.join("__init__.py"), PYTHON_INIT_TEMPLATE)?;
        self.write(&platform_dir.join("adapter.py"), PYTHON_ADAPTER_TEMPLATE)?;

        self.copy_env_files(context)?;
        self.copy_local_modules(context)?;

        fixer::try_fix_http_methods(&main_path);

        info!(build_path = %build_path.display(), "Build unit created");
        Ok(())
    }
}

fn sorted_keys(map: &HashMap<String, String>) -> Vec<&String> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    keys
}

fn is_standard_library(module: &str) -> bool {
    STANDARD_LIBRARY_MODULES.contains(&module)
}

fn is_local_module(module: &str, app_path: &Path) -> bool {
    app_path.join(format!("{module}.py")).is_file()
        || app_path.join(module).join("__init__.py").is_file()
}

fn format_import(import: &ImportBinding) -> String {
    if import.module == import.alias {
        return format!("import {}", import.module);
    }
    if let Some((parent, name)) = import.module.rsplit_once('.') {
        if name == import.alias {
            return format!("from {parent} import {name}");
        }
        return format!("from {parent} import {name} as {}", import.alias);
    }
    format!("import {} as {}", import.module, import.alias)
}

fn common_python_packages() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("flask", "Flask==2.0.1"),
        ("werkzeug", "Werkzeug==2.0.1"),
        ("jinja2", "Jinja2==3.0.1"),
        ("requests", "requests==2.26.0"),
        ("click", "click==8.0.1"),
        ("itsdangerous", "itsdangerous==2.0.1"),
        ("markupsafe", "MarkupSafe==2.0.1"),
        ("sqlalchemy", "SQLAlchemy==1.4.23"),
        ("pymysql", "PyMySQL==1.0.2"),
        ("pymongo", "pymongo==3.12.0"),
        ("psycopg2", "psycopg2-binary==2.9.7"),
        ("boto3", "boto3==1.18.44"),
        ("botocore", "botocore==1.21.44"),
        ("pandas", "pandas==1.3.3"),
        ("numpy", "numpy==1.21.2"),
        ("matplotlib", "matplotlib==3.4.3"),
        ("pillow", "Pillow==8.3.2"),
        ("pyjwt", "PyJWT==2.1.0"),
        ("python-dotenv", "python-dotenv==0.19.0"),
        ("dotenv", "python-dotenv==0.19.0"),
        ("six", "six==1.16.0"),
        ("pytz", "pytz==2021.1"),
        ("urllib3", "urllib3==1.26.6"),
    ])
}
