//! Command materialization.
//!
//! A stage carries a [`CommandTemplate`]; combined with the stage's resolved
//! inputs it becomes a concrete [`CommandSpec`]. Optional inputs resolved to
//! a sentinel drop their flag entirely: no flag token, no placeholder value.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Resolution;

use super::graph::Stage;

/// Resolved inputs of one stage, keyed by binding alias in binding order
pub type ResolvedInputs = IndexMap<String, Resolution>;

/// One piece of an argument list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arg {
    /// Passed through verbatim
    Lit(String),

    /// The value of a required input
    Input(String),

    /// `flag value` for a required input
    Flag(String, String),

    /// `flag value` when the input is present, nothing at all otherwise
    OptionalFlag(String, String),

    /// The value of a required input substituted for `{value}` in a format
    Format { alias: String, format: String },

    /// One token per staged file of a multi-file input.
    ///
    /// `{path}` expands to the staged relative path, `{stem}` to the file
    /// name up to its first dot.
    Each { alias: String, format: String },
}

impl Arg {
    pub fn lit(value: impl Into<String>) -> Self {
        Self::Lit(value.into())
    }

    pub fn input(alias: impl Into<String>) -> Self {
        Self::Input(alias.into())
    }

    pub fn flag(flag: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::Flag(flag.into(), alias.into())
    }

    pub fn optional_flag(flag: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::OptionalFlag(flag.into(), alias.into())
    }

    pub fn format(alias: impl Into<String>, format: impl Into<String>) -> Self {
        Self::Format {
            alias: alias.into(),
            format: format.into(),
        }
    }

    pub fn each(alias: impl Into<String>, format: impl Into<String>) -> Self {
        Self::Each {
            alias: alias.into(),
            format: format.into(),
        }
    }
}

/// Template for one program invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationTemplate {
    /// Logical program name, mapped through the tool table
    pub program: String,

    pub args: Vec<Arg>,

    /// Capture stdout into this file (relative to the working directory)
    pub stdout: Option<String>,
}

impl InvocationTemplate {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdout: None,
        }
    }

    pub fn arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    /// Append literal arguments
    pub fn lits<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(values.into_iter().map(|v| Arg::Lit(v.into())));
        self
    }

    pub fn stdout_to(mut self, file: impl Into<String>) -> Self {
        self.stdout = Some(file.into());
        self
    }
}

/// The command script of a stage: invocations run in order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub invocations: Vec<InvocationTemplate>,
}

impl CommandTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, invocation: InvocationTemplate) -> Self {
        self.invocations.push(invocation);
        self
    }
}

/// A concrete program invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdout: Option<PathBuf>,
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&shell_quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        if let Some(stdout) = &self.stdout {
            write!(f, " > {}", shell_quote(&stdout.to_string_lossy()))?;
        }
        Ok(())
    }
}

/// The concrete command script of a stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub invocations: Vec<Invocation>,
}

impl CommandSpec {
    /// Every program and argument token, in order
    pub fn tokens(&self) -> Vec<String> {
        self.invocations
            .iter()
            .flat_map(|i| std::iter::once(i.program.clone()).chain(i.args.iter().cloned()))
            .collect()
    }

    /// Whether any invocation carries this exact token
    pub fn contains_token(&self, token: &str) -> bool {
        self.invocations
            .iter()
            .any(|i| i.program == token || i.args.iter().any(|a| a == token))
    }

    /// Shell-like rendering, used for logs and cache keys
    pub fn render(&self) -> String {
        self.invocations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" && ")
    }
}

fn shell_quote(token: &str) -> String {
    let plain = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', r"'\''"))
    }
}

/// Errors turning a template into a command
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MaterializeError {
    #[error("stage '{stage}' references input '{alias}' that it does not bind")]
    UnboundInput { stage: String, alias: String },

    #[error("stage '{stage}' requires input '{alias}' but it resolved to {sentinel}")]
    AbsentInput {
        stage: String,
        alias: String,
        sentinel: String,
    },

    #[error("stage '{stage}' expands '{alias}' per file but it is not a file list")]
    NotAFileList { stage: String, alias: String },
}

/// Relative path under which a file of a multi-file input is staged
pub fn staged_path(alias: &str, file: &Path) -> PathBuf {
    let name = file
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| file.to_path_buf());
    Path::new(alias).join(name)
}

fn stem_of(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split('.').next())
        .unwrap_or_default()
        .to_string()
}

/// Builds concrete commands from stage templates
#[derive(Debug, Clone, Default)]
pub struct Materializer {
    /// Logical program name -> executable
    tools: BTreeMap<String, String>,
}

impl Materializer {
    pub fn new(tools: BTreeMap<String, String>) -> Self {
        Self { tools }
    }

    fn program(&self, name: &str) -> String {
        self.tools
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    /// Build the command of a stage from its resolved inputs
    pub fn materialize(
        &self,
        stage: &Stage,
        inputs: &ResolvedInputs,
    ) -> Result<CommandSpec, MaterializeError> {
        let invocations = stage
            .command
            .invocations
            .iter()
            .map(|template| {
                let mut args = Vec::new();
                for arg in &template.args {
                    self.expand(stage, arg, inputs, &mut args)?;
                }
                Ok(Invocation {
                    program: self.program(&template.program),
                    args,
                    stdout: template.stdout.as_ref().map(PathBuf::from),
                })
            })
            .collect::<Result<Vec<_>, MaterializeError>>()?;

        Ok(CommandSpec { invocations })
    }

    fn expand(
        &self,
        stage: &Stage,
        arg: &Arg,
        inputs: &ResolvedInputs,
        out: &mut Vec<String>,
    ) -> Result<(), MaterializeError> {
        let lookup = |alias: &str| {
            inputs
                .get(alias)
                .ok_or_else(|| MaterializeError::UnboundInput {
                    stage: stage.name.clone(),
                    alias: alias.to_string(),
                })
        };

        match arg {
            Arg::Lit(value) => out.push(value.clone()),
            Arg::Input(alias) => out.push(required_token(stage, alias, lookup(alias)?)?),
            Arg::Flag(flag, alias) => {
                let value = required_token(stage, alias, lookup(alias)?)?;
                out.push(flag.clone());
                out.push(value);
            }
            Arg::Format { alias, format } => {
                let value = required_token(stage, alias, lookup(alias)?)?;
                out.push(format.replace("{value}", &value));
            }
            Arg::OptionalFlag(flag, alias) => {
                let resolution = lookup(alias)?;
                if resolution.is_present() {
                    out.push(flag.clone());
                    out.push(value_token(alias, resolution));
                }
            }
            Arg::Each { alias, format } => match lookup(alias)? {
                Resolution::Paths(paths) => {
                    for path in paths {
                        let staged = staged_path(alias, path);
                        out.push(
                            format
                                .replace("{path}", &staged.to_string_lossy())
                                .replace("{stem}", &stem_of(path)),
                        );
                    }
                }
                _ => {
                    return Err(MaterializeError::NotAFileList {
                        stage: stage.name.clone(),
                        alias: alias.clone(),
                    })
                }
            },
        }
        Ok(())
    }
}

fn required_token(
    stage: &Stage,
    alias: &str,
    resolution: &Resolution,
) -> Result<String, MaterializeError> {
    match resolution {
        Resolution::Absent(sentinel) => Err(MaterializeError::AbsentInput {
            stage: stage.name.clone(),
            alias: alias.to_string(),
            sentinel: sentinel.to_string(),
        }),
        present => Ok(value_token(alias, present)),
    }
}

/// Multi-file inputs are referenced through their staging directory
fn value_token(alias: &str, resolution: &Resolution) -> String {
    match resolution {
        Resolution::Path(path) => path.to_string_lossy().into_owned(),
        Resolution::Value(value) => value.clone(),
        Resolution::Paths(_) => alias.to_string(),
        Resolution::Absent(sentinel) => sentinel.literal().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::{Branch, InputBinding, OutputDecl};
    use crate::domain::{ArtifactKind, ParamName, Sentinel};

    fn stage() -> Stage {
        Stage::new("differential_expression", Branch::Expression)
            .bind(InputBinding::param("counts", ParamName::Rawcounts))
            .bind(InputBinding::param("genelist", ParamName::Genelist))
            .output(OutputDecl::new(
                "archive",
                ArtifactKind::ZipArchive,
                "differential_gene_expression.zip",
            ))
            .command(
                CommandTemplate::new().then(
                    InvocationTemplate::new("Rscript")
                        .lits(["DESeq2.R"])
                        .arg(Arg::flag("--counts", "counts"))
                        .arg(Arg::optional_flag("--genelist", "genelist")),
                ),
            )
    }

    fn inputs(genelist: Resolution) -> ResolvedInputs {
        let mut inputs = ResolvedInputs::new();
        inputs.insert("counts".into(), Resolution::Path("/in/counts.tsv".into()));
        inputs.insert("genelist".into(), genelist);
        inputs
    }

    #[test]
    fn test_optional_flag_omitted_for_sentinel() {
        let spec = Materializer::default()
            .materialize(&stage(), &inputs(Resolution::Absent(Sentinel::NoFile)))
            .unwrap();

        assert_eq!(
            spec.tokens(),
            vec!["Rscript", "DESeq2.R", "--counts", "/in/counts.tsv"]
        );
        assert!(!spec.contains_token("--genelist"));
        assert!(!spec.contains_token("NO_FILE"));
    }

    #[test]
    fn test_optional_flag_present() {
        let spec = Materializer::default()
            .materialize(&stage(), &inputs(Resolution::Path("/in/genes.txt".into())))
            .unwrap();

        assert!(spec.render().ends_with("--genelist /in/genes.txt"));
    }

    #[test]
    fn test_tool_table_maps_programs() {
        let tools = [("Rscript".to_string(), "/opt/R/bin/Rscript".to_string())]
            .into_iter()
            .collect();
        let spec = Materializer::new(tools)
            .materialize(&stage(), &inputs(Resolution::Absent(Sentinel::NoFile)))
            .unwrap();

        assert_eq!(spec.invocations[0].program, "/opt/R/bin/Rscript");
    }

    #[test]
    fn test_required_input_cannot_be_absent() {
        let mut resolved = inputs(Resolution::Absent(Sentinel::NoFile));
        resolved.insert("counts".into(), Resolution::Absent(Sentinel::NoFile));

        let err = Materializer::default()
            .materialize(&stage(), &resolved)
            .unwrap_err();
        assert!(matches!(err, MaterializeError::AbsentInput { .. }));
    }

    #[test]
    fn test_each_expands_staged_paths() {
        let stage = Stage::new("taxonomy_visualization", Branch::Metagenomics).command(
            CommandTemplate::new().then(
                InvocationTemplate::new("ktImportText")
                    .lits(["-o", "taxonomy.html"])
                    .arg(Arg::each("krona", "{path},{stem}")),
            ),
        );
        let mut resolved = ResolvedInputs::new();
        resolved.insert(
            "krona".into(),
            Resolution::Paths(vec![
                "/work/profile_a/a.krona.txt".into(),
                "/work/profile_b/b.krona.txt".into(),
            ]),
        );

        let spec = Materializer::default().materialize(&stage, &resolved).unwrap();
        assert_eq!(
            spec.invocations[0].args,
            vec!["-o", "taxonomy.html", "krona/a.krona.txt,a", "krona/b.krona.txt,b"]
        );
    }

    #[test]
    fn test_format_substitutes_value() {
        let stage = Stage::new("profile_s1", Branch::Metagenomics).command(
            CommandTemplate::new().then(
                InvocationTemplate::new("humann2")
                    .arg(Arg::lit("--nucleotide-database"))
                    .arg(Arg::format("db", "{value}/chocophlan")),
            ),
        );
        let mut resolved = ResolvedInputs::new();
        resolved.insert("db".into(), Resolution::Path("/work/prepare/humann2_db".into()));

        let spec = Materializer::default().materialize(&stage, &resolved).unwrap();
        assert_eq!(
            spec.tokens(),
            vec!["humann2", "--nucleotide-database", "/work/prepare/humann2_db/chocophlan"]
        );
    }

    #[test]
    fn test_render_quotes_and_redirects() {
        let spec = CommandSpec {
            invocations: vec![Invocation {
                program: "Rscript".into(),
                args: vec!["-e".into(), "write(x='1')".into()],
                stdout: Some(PathBuf::from("v.txt")),
            }],
        };
        assert_eq!(spec.render(), r#"Rscript -e 'write(x='\''1'\'')' > v.txt"#);
    }
}
