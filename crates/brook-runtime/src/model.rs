//! Declarative dataflow models
//!
//! A [`Model`] collects input reports, artificial (derived) fields, and
//! output reports, then compiles them into the consumer graph the worker
//! runtime executes: one splitter per input report, one generator per
//! artificial field, one resolver per output report.
//!
//! Dependencies are declared explicitly against [`FieldRef`] handles
//! returned by registration; there is no runtime introspection. Artificial
//! fields may also be referenced by name for history dependencies, which
//! allows self- and forward-references; those resolve at compile time.

use crate::broker::BrokerError;
use brook_core::{
    schema::{PropertySchema, ReportSchema},
    BrookSchema, FieldInfo, FieldType, MessageId, StreamInfo, Value, ARTIFICIAL_NAMESPACE,
    DEFAULT_SPECIAL_CHAR, ID_FIELD, ID_STREAM_SUFFIX, MSG_ID_FIELD,
};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors detected while registering or compiling a model. All of these
/// are programming errors in the model description and fail fast.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("duplicate report name '{0}'")]
    DuplicateReport(String),
    #[error("duplicate artificial field '{0}'")]
    DuplicateArtificial(String),
    #[error("report '{report}' has no field '{field}'")]
    UnknownField { report: String, field: String },
    #[error("report '{report}' declares id_field '{id_field}' which is not one of its fields")]
    UnknownIdField { report: String, id_field: String },
    #[error("history dependency of '{field}' references unknown artificial field '{target}'")]
    UnknownArtificial { field: String, target: String },
    #[error("dependency cycle among artificial fields: {0}")]
    DependencyCycle(String),
    #[error("report '{0}' declares no fields")]
    EmptyReport(String),
    #[error("artificial field '{field}' declares duplicate parameter '{param}'")]
    DuplicateParam { field: String, param: String },
    #[error("artificial field '{0}' declares no current dependency")]
    NoCurrentDependency(String),
    #[error("history window of '{field}' parameter '{param}' must be at least 1")]
    HistoryLengthZero { field: String, param: String },
    #[error("schema metadata references unknown field '{field}' of output '{report}'")]
    UnknownMetaField { report: String, field: String },
}

/// Errors raised by user field computations.
#[derive(Debug, Error)]
pub enum FieldError {
    #[error("missing dependency '{0}'")]
    MissingDependency(String),
    #[error("dependency '{param}' is {actual}, expected {expected}")]
    WrongType {
        param: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("{0}")]
    Failed(String),
}

impl FieldError {
    pub fn failed(msg: impl Into<String>) -> Self {
        FieldError::Failed(msg.into())
    }
}

/// Inputs handed to a field computation: current dependency values and
/// history windows, keyed by the declared parameter names.
#[derive(Debug, Clone)]
pub struct FieldContext {
    pub msg_id: MessageId,
    values: HashMap<String, Value>,
    history: HashMap<String, Vec<Value>>,
}

impl FieldContext {
    pub fn new(
        msg_id: MessageId,
        values: HashMap<String, Value>,
        history: HashMap<String, Vec<Value>>,
    ) -> Self {
        Self {
            msg_id,
            values,
            history,
        }
    }

    pub fn value(&self, param: &str) -> Result<&Value, FieldError> {
        self.values
            .get(param)
            .ok_or_else(|| FieldError::MissingDependency(param.to_string()))
    }

    pub fn float(&self, param: &str) -> Result<f64, FieldError> {
        let value = self.value(param)?;
        value.as_float().ok_or_else(|| FieldError::WrongType {
            param: param.to_string(),
            expected: "float",
            actual: value.type_name(),
        })
    }

    pub fn int(&self, param: &str) -> Result<i64, FieldError> {
        let value = self.value(param)?;
        value.as_int().ok_or_else(|| FieldError::WrongType {
            param: param.to_string(),
            expected: "int",
            actual: value.type_name(),
        })
    }

    pub fn str(&self, param: &str) -> Result<&str, FieldError> {
        let value = self.value(param)?;
        value.as_str().ok_or_else(|| FieldError::WrongType {
            param: param.to_string(),
            expected: "str",
            actual: value.type_name(),
        })
    }

    /// History window for `param`, oldest first, padded with nulls.
    pub fn history(&self, param: &str) -> Result<&[Value], FieldError> {
        self.history
            .get(param)
            .map(|w| w.as_slice())
            .ok_or_else(|| FieldError::MissingDependency(param.to_string()))
    }
}

/// The future returned by a field computation.
pub type FieldFuture = BoxFuture<'static, Result<Value, FieldError>>;

/// A registered field computation.
pub type FieldFn = Arc<dyn Fn(FieldContext) -> FieldFuture + Send + Sync>;

/// Identity of a field usable as a dependency target: the sub-stream its
/// per-message values live on, plus the payload field name within records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub stream: String,
    pub field: String,
    pub field_type: FieldType,
}

/// Declaration of an input report.
#[derive(Debug, Clone)]
pub struct InputReport {
    name: String,
    id_field: String,
    fields: IndexMap<String, FieldType>,
}

impl InputReport {
    pub fn new(name: &str, id_field: &str) -> Self {
        Self {
            name: name.to_string(),
            id_field: id_field.to_string(),
            fields: IndexMap::new(),
        }
    }

    pub fn field(mut self, name: &str, field_type: FieldType) -> Self {
        self.fields.insert(name.to_string(), field_type);
        self
    }
}

/// Handle to a registered input report; the way to reference its fields.
#[derive(Debug, Clone)]
pub struct InputHandle {
    name: String,
    fields: IndexMap<String, FieldType>,
}

impl InputHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field(&self, name: &str) -> Result<FieldRef, CompileError> {
        let field_type =
            *self
                .fields
                .get(name)
                .ok_or_else(|| CompileError::UnknownField {
                    report: self.name.clone(),
                    field: name.to_string(),
                })?;
        Ok(FieldRef {
            stream: format!("{}:{}", self.name, name),
            field: name.to_string(),
            field_type,
        })
    }

    /// Reference to the identity sub-stream, carrying the source id.
    pub fn id_ref(&self) -> FieldRef {
        FieldRef {
            stream: format!("{}:{}", self.name, ID_STREAM_SUFFIX),
            field: ID_FIELD.to_string(),
            field_type: FieldType::String,
        }
    }
}

/// Target of a history dependency.
#[derive(Debug, Clone)]
enum HistoryTarget {
    Field(FieldRef),
    Named(String),
    SelfField,
}

#[derive(Debug, Clone)]
struct HistoryDep {
    param: String,
    target: HistoryTarget,
    len: usize,
}

/// Declaration of an artificial (derived) field.
#[derive(Debug, Clone)]
pub struct DerivedField {
    name: String,
    field_type: FieldType,
    current: Vec<(String, FieldRef)>,
    history: Vec<HistoryDep>,
}

impl DerivedField {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            current: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Depend on `field`'s value for the same message.
    pub fn current(mut self, param: &str, field: FieldRef) -> Self {
        self.current.push((param.to_string(), field));
        self
    }

    /// Depend on the window of the `len` most recent prior values of
    /// `field` for the same source.
    pub fn history(mut self, param: &str, field: FieldRef, len: usize) -> Self {
        self.history.push(HistoryDep {
            param: param.to_string(),
            target: HistoryTarget::Field(field),
            len,
        });
        self
    }

    /// History dependency on an artificial field referenced by name.
    /// Resolved at compile time, so forward and mutual references work.
    pub fn history_named(mut self, param: &str, target: &str, len: usize) -> Self {
        self.history.push(HistoryDep {
            param: param.to_string(),
            target: HistoryTarget::Named(target.to_string()),
            len,
        });
        self
    }

    /// History dependency on this field's own prior values.
    pub fn self_history(mut self, param: &str, len: usize) -> Self {
        self.history.push(HistoryDep {
            param: param.to_string(),
            target: HistoryTarget::SelfField,
            len,
        });
        self
    }
}

/// Declaration of an output report.
#[derive(Debug, Clone)]
pub struct OutputReport {
    name: String,
    fields: Vec<(String, FieldRef)>,
}

impl OutputReport {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, dst: &str, source: FieldRef) -> Self {
        self.fields.push((dst.to_string(), source));
        self
    }
}

/// Schema metadata wiring for frontends: `(output report, field)` pairs.
#[derive(Debug, Clone, Default)]
pub struct SchemaMeta {
    latitude: Option<(String, String)>,
    longitude: Option<(String, String)>,
    time: Option<(String, String)>,
    group: Option<(String, String)>,
    direction: Option<(String, String)>,
}

impl SchemaMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latitude(mut self, report: &str, field: &str) -> Self {
        self.latitude = Some((report.to_string(), field.to_string()));
        self
    }

    pub fn longitude(mut self, report: &str, field: &str) -> Self {
        self.longitude = Some((report.to_string(), field.to_string()));
        self
    }

    pub fn time(mut self, report: &str, field: &str) -> Self {
        self.time = Some((report.to_string(), field.to_string()));
        self
    }

    pub fn group(mut self, report: &str, field: &str) -> Self {
        self.group = Some((report.to_string(), field.to_string()));
        self
    }

    pub fn direction(mut self, report: &str, field: &str) -> Self {
        self.direction = Some((report.to_string(), field.to_string()));
        self
    }
}

struct ArtificialEntry {
    decl: DerivedField,
    func: FieldFn,
}

struct InputDecl {
    name: String,
    id_field: String,
    fields: IndexMap<String, FieldType>,
}

/// A declarative model under construction.
pub struct Model {
    special_char: char,
    inputs: IndexMap<String, InputDecl>,
    artificials: IndexMap<String, ArtificialEntry>,
    outputs: IndexMap<String, OutputReport>,
    meta: SchemaMeta,
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    pub fn new() -> Self {
        Self {
            special_char: DEFAULT_SPECIAL_CHAR,
            inputs: IndexMap::new(),
            artificials: IndexMap::new(),
            outputs: IndexMap::new(),
            meta: SchemaMeta::default(),
        }
    }

    /// Override the separator byte used in message ids.
    pub fn special_char(mut self, sep: char) -> Self {
        self.special_char = sep;
        self
    }

    /// Register an input report.
    pub fn input(&mut self, report: InputReport) -> Result<InputHandle, CompileError> {
        if report.fields.is_empty() {
            return Err(CompileError::EmptyReport(report.name));
        }
        if !report.fields.contains_key(&report.id_field) {
            return Err(CompileError::UnknownIdField {
                report: report.name,
                id_field: report.id_field,
            });
        }
        if self.inputs.contains_key(&report.name) || self.outputs.contains_key(&report.name) {
            return Err(CompileError::DuplicateReport(report.name));
        }
        let handle = InputHandle {
            name: report.name.clone(),
            fields: report.fields.clone(),
        };
        self.inputs.insert(
            report.name.clone(),
            InputDecl {
                name: report.name,
                id_field: report.id_field,
                fields: report.fields,
            },
        );
        Ok(handle)
    }

    /// Register an artificial field with its computation. Returns the
    /// reference other fields and reports use to depend on it.
    pub fn derived<F, Fut>(
        &mut self,
        decl: DerivedField,
        func: F,
    ) -> Result<FieldRef, CompileError>
    where
        F: Fn(FieldContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, FieldError>> + Send + 'static,
    {
        if self.artificials.contains_key(&decl.name) {
            return Err(CompileError::DuplicateArtificial(decl.name));
        }
        // A generator only consumes current-dependency sub-streams, so a
        // field without one would never be triggered at runtime.
        if decl.current.is_empty() {
            return Err(CompileError::NoCurrentDependency(decl.name));
        }
        let mut params: Vec<&String> = decl
            .current
            .iter()
            .map(|(p, _)| p)
            .chain(decl.history.iter().map(|h| &h.param))
            .collect();
        params.sort();
        if let Some(dup) = params.windows(2).find(|w| w[0] == w[1]) {
            return Err(CompileError::DuplicateParam {
                field: decl.name.clone(),
                param: dup[0].clone(),
            });
        }
        if let Some(h) = decl.history.iter().find(|h| h.len == 0) {
            return Err(CompileError::HistoryLengthZero {
                field: decl.name.clone(),
                param: h.param.clone(),
            });
        }
        let reference = artificial_ref(&decl.name, decl.field_type);
        let func: FieldFn = Arc::new(move |ctx| -> FieldFuture { Box::pin(func(ctx)) });
        self.artificials
            .insert(decl.name.clone(), ArtificialEntry { decl, func });
        Ok(reference)
    }

    /// Register an output report.
    pub fn output(&mut self, report: OutputReport) -> Result<(), CompileError> {
        if report.fields.is_empty() {
            return Err(CompileError::EmptyReport(report.name));
        }
        if self.inputs.contains_key(&report.name) || self.outputs.contains_key(&report.name) {
            return Err(CompileError::DuplicateReport(report.name));
        }
        self.outputs.insert(report.name.clone(), report);
        Ok(())
    }

    /// Set the frontend schema metadata.
    pub fn set_meta(&mut self, meta: SchemaMeta) {
        self.meta = meta;
    }

    /// Validate the model and produce the consumer graph.
    pub fn compile(self) -> Result<CompiledModel, CompileError> {
        // Resolve named/self history targets against registered artificials.
        let mut resolved: IndexMap<String, (DerivedField, FieldFn, Vec<(String, FieldRef, usize)>)> =
            IndexMap::new();
        for (name, entry) in &self.artificials {
            let mut history = Vec::new();
            for dep in &entry.decl.history {
                let target = match &dep.target {
                    HistoryTarget::Field(r) => r.clone(),
                    HistoryTarget::SelfField => {
                        artificial_ref(name, entry.decl.field_type)
                    }
                    HistoryTarget::Named(target) => {
                        let target_entry = self.artificials.get(target).ok_or_else(|| {
                            CompileError::UnknownArtificial {
                                field: name.clone(),
                                target: target.clone(),
                            }
                        })?;
                        artificial_ref(target, target_entry.decl.field_type)
                    }
                };
                history.push((dep.param.clone(), target, dep.len));
            }
            resolved.insert(
                name.clone(),
                (entry.decl.clone(), entry.func.clone(), history),
            );
        }

        let generation_order = self.check_cycles(&resolved)?;

        // Per-field maximum declared history window ("observer" caps),
        // keyed by the observed field's stream name.
        let mut history_caps: HashMap<String, usize> = HashMap::new();
        for (_, _, history) in resolved.values() {
            for (_, target, len) in history {
                let cap = history_caps.entry(target.stream.clone()).or_insert(0);
                *cap = (*cap).max(*len);
            }
        }

        let splitters = self
            .inputs
            .values()
            .map(|input| SplitterSpec {
                report: input.name.clone(),
                input_stream: input.name.clone(),
                group: format!("split-{}", input.name),
                id_field: input.id_field.clone(),
                fields: input.fields.keys().cloned().collect(),
                history: input
                    .fields
                    .keys()
                    .filter_map(|field| {
                        let stream = format!("{}:{}", input.name, field);
                        history_caps.get(&stream).map(|cap| (field.clone(), *cap))
                    })
                    .collect(),
            })
            .collect();

        let mut generators = Vec::new();
        for (name, (decl, func, history)) in &resolved {
            let own_stream = artificial_stream(name);
            let current: Vec<DepSpec> = decl
                .current
                .iter()
                .map(|(param, field)| DepSpec {
                    param: param.clone(),
                    stream: field.stream.clone(),
                    field: field.field.clone(),
                })
                .collect();
            let history_specs: Vec<HistSpec> = history
                .iter()
                .map(|(param, target, len)| HistSpec {
                    param: param.clone(),
                    stream: target.stream.clone(),
                    field: target.field.clone(),
                    len: *len,
                    is_self: target.stream == own_stream,
                })
                .collect();
            let mut reads: Vec<String> = current.iter().map(|d| d.stream.clone()).collect();
            for spec in &history_specs {
                if !spec.is_self && !reads.contains(&spec.stream) {
                    reads.push(spec.stream.clone());
                }
            }
            generators.push(GeneratorSpec {
                field: name.clone(),
                group: format!("gen-{name}"),
                output_stream: own_stream.clone(),
                current,
                history: history_specs,
                reads,
                own_history_cap: history_caps.get(&own_stream).copied(),
                func: func.clone(),
            });
        }

        let resolvers = self
            .outputs
            .values()
            .map(|output| ResolverSpec {
                report: output.name.clone(),
                group: format!("out-{}", output.name),
                output_stream: output.name.clone(),
                channel: output.name.clone(),
                fields: output
                    .fields
                    .iter()
                    .map(|(dst, field)| DepSpec {
                        param: dst.clone(),
                        stream: field.stream.clone(),
                        field: field.field.clone(),
                    })
                    .collect(),
            })
            .collect();

        let schema = self.build_schema()?;

        Ok(CompiledModel {
            special_char: self.special_char,
            splitters,
            generators,
            resolvers,
            generation_order,
            schema,
        })
    }

    /// Reject cycles in the current-dependency subgraph and return a
    /// topological order of the artificial fields. History edges are
    /// exempt: a field reading its own (or a peer's) history is legal.
    fn check_cycles(
        &self,
        resolved: &IndexMap<String, (DerivedField, FieldFn, Vec<(String, FieldRef, usize)>)>,
    ) -> Result<Vec<String>, CompileError> {
        // Edges f -> g where f currently depends on artificial g.
        let mut edges: HashMap<&str, Vec<String>> = HashMap::new();
        for (name, (decl, _, _)) in resolved {
            let deps = decl
                .current
                .iter()
                .filter_map(|(_, field)| artificial_name(&field.stream))
                .collect();
            edges.insert(name.as_str(), deps);
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        fn visit(
            node: &str,
            edges: &HashMap<&str, Vec<String>>,
            marks: &mut HashMap<String, Mark>,
            path: &mut Vec<String>,
            order: &mut Vec<String>,
        ) -> Result<(), CompileError> {
            match marks.get(node).copied().unwrap_or(Mark::Unvisited) {
                Mark::Done => return Ok(()),
                Mark::InProgress => {
                    let start = path.iter().position(|p| p == node).unwrap_or(0);
                    let mut cycle: Vec<&str> =
                        path[start..].iter().map(String::as_str).collect();
                    cycle.push(node);
                    return Err(CompileError::DependencyCycle(cycle.join(" -> ")));
                }
                Mark::Unvisited => {}
            }
            marks.insert(node.to_string(), Mark::InProgress);
            path.push(node.to_string());
            if let Some(deps) = edges.get(node) {
                for dep in deps {
                    visit(dep, edges, marks, path, order)?;
                }
            }
            path.pop();
            marks.insert(node.to_string(), Mark::Done);
            order.push(node.to_string());
            Ok(())
        }

        let mut marks = HashMap::new();
        let mut order = Vec::new();
        for name in resolved.keys() {
            visit(name, &edges, &mut marks, &mut Vec::new(), &mut order)?;
        }
        Ok(order)
    }

    fn build_schema(&self) -> Result<BrookSchema, CompileError> {
        let mut schema = BrookSchema::new(self.special_char);
        for output in self.outputs.values() {
            let mut properties = IndexMap::new();
            for (dst, field) in &output.fields {
                properties.insert(
                    dst.clone(),
                    PropertySchema {
                        field_type: field.field_type.json_type().to_string(),
                        title: dst.clone(),
                    },
                );
            }
            properties.insert(
                MSG_ID_FIELD.to_string(),
                PropertySchema {
                    field_type: "string".to_string(),
                    title: "Message ID".to_string(),
                },
            );
            schema.streams.push(StreamInfo {
                stream_name: output.name.clone(),
                websocket_path: format!("/{}", output.name),
                report_schema: ReportSchema { properties },
            });
        }

        let resolve_meta = |target: &Option<(String, String)>| -> Result<Option<FieldInfo>, CompileError> {
            let Some((report, field)) = target else {
                return Ok(None);
            };
            let output = self
                .outputs
                .get(report)
                .filter(|o| o.fields.iter().any(|(dst, _)| dst == field))
                .ok_or_else(|| CompileError::UnknownMetaField {
                    report: report.clone(),
                    field: field.clone(),
                })?;
            Ok(Some(FieldInfo {
                stream_name: output.name.clone(),
                field_name: field.clone(),
            }))
        };

        schema.latitude_field = resolve_meta(&self.meta.latitude)?;
        schema.longitude_field = resolve_meta(&self.meta.longitude)?;
        schema.time_field = resolve_meta(&self.meta.time)?;
        schema.group_field = resolve_meta(&self.meta.group)?;
        schema.direction_field = resolve_meta(&self.meta.direction)?;
        Ok(schema)
    }
}

fn artificial_stream(name: &str) -> String {
    format!("{ARTIFICIAL_NAMESPACE}:{name}")
}

fn artificial_ref(name: &str, field_type: FieldType) -> FieldRef {
    FieldRef {
        stream: artificial_stream(name),
        field: name.to_string(),
        field_type,
    }
}

/// Name of the artificial field carried by `stream`, if it is one.
fn artificial_name(stream: &str) -> Option<String> {
    stream
        .strip_prefix(ARTIFICIAL_NAMESPACE)
        .and_then(|rest| rest.strip_prefix(':'))
        .map(|s| s.to_string())
}

/// One current dependency or output field binding.
#[derive(Debug, Clone)]
pub struct DepSpec {
    /// Parameter name (generators) or destination field name (resolvers).
    pub param: String,
    /// Sub-stream the value arrives on.
    pub stream: String,
    /// Payload field name within sub-stream records.
    pub field: String,
}

/// One historical dependency.
#[derive(Debug, Clone)]
pub struct HistSpec {
    pub param: String,
    /// Stream name of the observed field; also its history-ring identity.
    pub stream: String,
    /// Payload field name within the observed field's sub-stream records.
    pub field: String,
    pub len: usize,
    /// Whether this is the generator's own output field.
    pub is_self: bool,
}

/// Compiled splitter role.
#[derive(Debug, Clone)]
pub struct SplitterSpec {
    pub report: String,
    pub input_stream: String,
    pub group: String,
    pub id_field: String,
    pub fields: Vec<String>,
    /// Source fields some consumer keeps history of, with their ring caps.
    pub history: Vec<(String, usize)>,
}

/// Compiled generator role.
#[derive(Clone)]
pub struct GeneratorSpec {
    pub field: String,
    pub group: String,
    pub output_stream: String,
    pub current: Vec<DepSpec>,
    pub history: Vec<HistSpec>,
    /// Distinct sub-streams this generator consumes.
    pub reads: Vec<String>,
    /// Ring cap for this field's own history, when someone observes it.
    pub own_history_cap: Option<usize>,
    pub func: FieldFn,
}

impl std::fmt::Debug for GeneratorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorSpec")
            .field("field", &self.field)
            .field("group", &self.group)
            .field("reads", &self.reads)
            .finish_non_exhaustive()
    }
}

/// Compiled resolver role.
#[derive(Debug, Clone)]
pub struct ResolverSpec {
    pub report: String,
    pub group: String,
    pub output_stream: String,
    pub channel: String,
    pub fields: Vec<DepSpec>,
}

/// A validated model, ready to run.
#[derive(Debug, Clone)]
pub struct CompiledModel {
    pub special_char: char,
    pub splitters: Vec<SplitterSpec>,
    pub generators: Vec<GeneratorSpec>,
    pub resolvers: Vec<ResolverSpec>,
    /// Artificial fields in current-dependency order.
    pub generation_order: Vec<String>,
    pub schema: BrookSchema,
}

impl CompiledModel {
    /// Consumer group names of every role, one per role.
    pub fn groups(&self) -> Vec<String> {
        self.splitters
            .iter()
            .map(|s| s.group.clone())
            .chain(self.generators.iter().map(|g| g.group.clone()))
            .chain(self.resolvers.iter().map(|r| r.group.clone()))
            .collect()
    }
}

/// Convenience conversion so broker errors can cross field computations.
impl From<BrokerError> for FieldError {
    fn from(e: BrokerError) -> Self {
        FieldError::Failed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vehicle_input() -> InputReport {
        InputReport::new("vehicle-report", "vehicle_number")
            .field("vehicle_number", FieldType::Integer)
            .field("lat", FieldType::Float)
            .field("lon", FieldType::Float)
    }

    #[test]
    fn test_unknown_id_field_rejected() {
        let mut model = Model::new();
        let err = model
            .input(InputReport::new("r", "nope").field("a", FieldType::Integer))
            .unwrap_err();
        assert_eq!(
            err,
            CompileError::UnknownIdField {
                report: "r".into(),
                id_field: "nope".into()
            }
        );
    }

    #[test]
    fn test_duplicate_report_rejected() {
        let mut model = Model::new();
        model.input(vehicle_input()).unwrap();
        assert_eq!(
            model.input(vehicle_input()).unwrap_err(),
            CompileError::DuplicateReport("vehicle-report".into())
        );
    }

    #[test]
    fn test_unknown_field_reference_rejected() {
        let mut model = Model::new();
        let input = model.input(vehicle_input()).unwrap();
        assert!(matches!(
            input.field("altitude"),
            Err(CompileError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_compile_simple_model() {
        let mut model = Model::new();
        let input = model.input(vehicle_input()).unwrap();
        let lat = input.field("lat").unwrap();
        let lon = input.field("lon").unwrap();

        let direction = model
            .derived(
                DerivedField::new("direction", FieldType::Float)
                    .current("lat", lat.clone())
                    .current("lon", lon.clone())
                    .history("lat_history", lat.clone(), 1)
                    .history("lon_history", lon.clone(), 1),
                |_ctx| async { Ok(Value::Null) },
            )
            .unwrap();
        model
            .output(
                OutputReport::new("direction-report").field("direction", direction),
            )
            .unwrap();
        model
            .output(
                OutputReport::new("location-report")
                    .field("lat", lat)
                    .field("lon", lon),
            )
            .unwrap();

        let compiled = model.compile().unwrap();
        assert_eq!(compiled.splitters.len(), 1);
        assert_eq!(compiled.generators.len(), 1);
        assert_eq!(compiled.resolvers.len(), 2);

        let splitter = &compiled.splitters[0];
        assert_eq!(splitter.group, "split-vehicle-report");
        // Both lat and lon are observed with window 1.
        let mut observed = splitter.history.clone();
        observed.sort();
        assert_eq!(observed, vec![("lat".to_string(), 1), ("lon".to_string(), 1)]);

        let generator = &compiled.generators[0];
        assert_eq!(generator.group, "gen-direction");
        assert_eq!(generator.output_stream, "artificial:direction");
        assert_eq!(
            generator.reads,
            vec![
                "vehicle-report:lat".to_string(),
                "vehicle-report:lon".to_string()
            ]
        );
        assert!(generator.own_history_cap.is_none());
    }

    #[test]
    fn test_self_history_is_legal_and_observed() {
        let mut model = Model::new();
        let input = model.input(vehicle_input()).unwrap();
        let lat = input.field("lat").unwrap();
        model
            .derived(
                DerivedField::new("counter", FieldType::Integer)
                    .current("lat", lat)
                    .self_history("previous", 1),
                |_ctx| async { Ok(Value::Int(0)) },
            )
            .unwrap();

        let compiled = model.compile().unwrap();
        let generator = &compiled.generators[0];
        assert_eq!(generator.own_history_cap, Some(1));
        // A generator never reads its own output stream.
        assert_eq!(generator.reads, vec!["vehicle-report:lat".to_string()]);
        assert!(generator.history[0].is_self);
    }

    #[test]
    fn test_current_cycle_names_fields() {
        let mut model = Model::new();
        let a_ref = artificial_ref("a", FieldType::Integer);
        let b_ref = artificial_ref("b", FieldType::Integer);
        model
            .derived(
                DerivedField::new("a", FieldType::Integer).current("b", b_ref),
                |_ctx| async { Ok(Value::Int(0)) },
            )
            .unwrap();
        model
            .derived(
                DerivedField::new("b", FieldType::Integer).current("a", a_ref),
                |_ctx| async { Ok(Value::Int(0)) },
            )
            .unwrap();

        let err = model.compile().unwrap_err();
        match err {
            CompileError::DependencyCycle(path) => {
                assert!(path.contains('a') && path.contains('b'), "path: {path}");
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_mutual_history_is_legal() {
        let mut model = Model::new();
        let input = model.input(vehicle_input()).unwrap();
        let lat = input.field("lat").unwrap();
        model
            .derived(
                DerivedField::new("a", FieldType::Integer)
                    .current("lat", lat.clone())
                    .history_named("b_prev", "b", 2),
                |_ctx| async { Ok(Value::Int(0)) },
            )
            .unwrap();
        model
            .derived(
                DerivedField::new("b", FieldType::Integer)
                    .current("lat", lat)
                    .history_named("a_prev", "a", 3),
                |_ctx| async { Ok(Value::Int(0)) },
            )
            .unwrap();

        let compiled = model.compile().unwrap();
        let a = compiled.generators.iter().find(|g| g.field == "a").unwrap();
        let b = compiled.generators.iter().find(|g| g.field == "b").unwrap();
        assert_eq!(a.own_history_cap, Some(3));
        assert_eq!(b.own_history_cap, Some(2));
    }

    #[test]
    fn test_history_on_unknown_artificial_rejected() {
        let mut model = Model::new();
        let input = model.input(vehicle_input()).unwrap();
        model
            .derived(
                DerivedField::new("f", FieldType::Integer)
                    .current("lat", input.field("lat").unwrap())
                    .history_named("x", "ghost", 1),
                |_ctx| async { Ok(Value::Int(0)) },
            )
            .unwrap();
        assert!(matches!(
            model.compile().unwrap_err(),
            CompileError::UnknownArtificial { .. }
        ));
    }

    #[test]
    fn test_history_only_field_rejected() {
        let mut model = Model::new();
        let err = model
            .derived(
                DerivedField::new("orphan", FieldType::Integer).self_history("previous", 1),
                |_ctx| async { Ok(Value::Int(0)) },
            )
            .unwrap_err();
        assert_eq!(err, CompileError::NoCurrentDependency("orphan".into()));
    }

    #[test]
    fn test_generation_order_is_topological() {
        let mut model = Model::new();
        let input = model.input(vehicle_input()).unwrap();
        let lat = input.field("lat").unwrap();
        let base = model
            .derived(
                DerivedField::new("base", FieldType::Float).current("lat", lat),
                |_ctx| async { Ok(Value::Null) },
            )
            .unwrap();
        model
            .derived(
                DerivedField::new("scaled", FieldType::Float).current("base", base),
                |_ctx| async { Ok(Value::Null) },
            )
            .unwrap();

        let compiled = model.compile().unwrap();
        let base_pos = compiled
            .generation_order
            .iter()
            .position(|f| f == "base")
            .unwrap();
        let scaled_pos = compiled
            .generation_order
            .iter()
            .position(|f| f == "scaled")
            .unwrap();
        assert!(base_pos < scaled_pos);
    }

    #[test]
    fn test_schema_document() {
        let mut model = Model::new();
        let input = model.input(vehicle_input()).unwrap();
        let lat = input.field("lat").unwrap();
        let lon = input.field("lon").unwrap();
        model
            .output(
                OutputReport::new("location-report")
                    .field("lat", lat)
                    .field("lon", lon),
            )
            .unwrap();
        model.set_meta(
            SchemaMeta::new()
                .latitude("location-report", "lat")
                .longitude("location-report", "lon"),
        );

        let compiled = model.compile().unwrap();
        let schema = &compiled.schema;
        assert_eq!(schema.streams.len(), 1);
        assert_eq!(schema.streams[0].websocket_path, "/location-report");
        assert!(schema.streams[0]
            .report_schema
            .properties
            .contains_key("_msg"));
        assert_eq!(
            schema.latitude_field,
            Some(FieldInfo {
                stream_name: "location-report".into(),
                field_name: "lat".into()
            })
        );
        assert!(schema.direction_field.is_none());
    }

    #[test]
    fn test_meta_on_unknown_field_rejected() {
        let mut model = Model::new();
        let input = model.input(vehicle_input()).unwrap();
        let lat = input.field("lat").unwrap();
        model
            .output(OutputReport::new("location-report").field("lat", lat))
            .unwrap();
        model.set_meta(SchemaMeta::new().latitude("location-report", "lon"));
        assert!(matches!(
            model.compile().unwrap_err(),
            CompileError::UnknownMetaField { .. }
        ));
    }

    #[test]
    fn test_duplicate_param_rejected() {
        let mut model = Model::new();
        let input = model.input(vehicle_input()).unwrap();
        let lat = input.field("lat").unwrap();
        let err = model
            .derived(
                DerivedField::new("f", FieldType::Float)
                    .current("x", lat.clone())
                    .history("x", lat, 1),
                |_ctx| async { Ok(Value::Null) },
            )
            .unwrap_err();
        assert_eq!(
            err,
            CompileError::DuplicateParam {
                field: "f".into(),
                param: "x".into()
            }
        );
    }
}
