//! 数据驱动迭代
//!
//! 每个字段单独声明取值方式 (静态值、CSV 列、数据源查询结果列、Mock 生成器)，
//! 按行组装后每行执行一次子步骤，行内字段注入迭代作用域。

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use steprun_common::{StepError, StepSpec};
use tracing::{debug, info};

use super::iterate::{iterate, IterationPlan, DEFAULT_INDEX_NAME};
use crate::{Controller, ControllerFactory, ExecutionContext, StepRuntime};

/// 字段取值方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldMode {
    #[default]
    Static,
    Csv,
    Datasource,
    Mock,
}

/// Mock 数据生成器
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MockGenerator {
    Int {
        #[serde(default)]
        min: i64,
        #[serde(default = "default_int_max")]
        max: i64,
    },
    Uuid,
    String {
        #[serde(default = "default_string_length")]
        length: usize,
    },
    Bool,
    Pick {
        values: Vec<Value>,
    },
    Seq {
        #[serde(default)]
        start: i64,
        #[serde(default = "default_seq_step")]
        step: i64,
    },
}

fn default_int_max() -> i64 {
    100
}

fn default_string_length() -> usize {
    8
}

fn default_seq_step() -> i64 {
    1
}

impl MockGenerator {
    /// 为第 `row` 行生成一个值
    pub fn generate(&self, rng: &mut StdRng, row: usize) -> Value {
        match self {
            Self::Int { min, max } => {
                let (low, high) = if min <= max { (*min, *max) } else { (*max, *min) };
                json!(rng.gen_range(low..=high))
            }
            Self::Uuid => json!(uuid::Builder::from_random_bytes(rng.gen()).into_uuid().to_string()),
            Self::String { length } => {
                let text: String = (0..*length)
                    .map(|_| rng.sample(Alphanumeric) as char)
                    .collect();
                json!(text)
            }
            Self::Bool => json!(rng.gen_bool(0.5)),
            Self::Pick { values } => values.choose(rng).cloned().unwrap_or(Value::Null),
            Self::Seq { start, step } => json!(start.wrapping_add(step.wrapping_mul(row as i64))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub mode: FieldMode,
    /// 静态值 (字符串中的模板会被渲染)
    #[serde(default)]
    pub values: Vec<Value>,
    /// CSV / 数据源中的列名，默认与字段同名
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub generator: Option<MockGenerator>,
}

impl FieldSpec {
    fn column(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataSourceQuery {
    /// 环境中声明的数据源
    pub id: String,
    pub query: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataSetConfig {
    #[serde(default)]
    fields: Vec<FieldSpec>,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    data_source: Option<DataSourceQuery>,
    #[serde(default)]
    count: Option<usize>,
    #[serde(default)]
    seed: Option<u64>,
    #[serde(default, rename = "async")]
    degree: Option<usize>,
    #[serde(default)]
    ignore_error: bool,
    #[serde(default)]
    index_name: Option<String>,
    #[serde(default)]
    interval: u64,
    #[serde(default)]
    continue_on_error: bool,
}

/// 数据集工厂，实例化前预读 CSV 文件
pub struct DataSetFactory;

#[async_trait]
impl ControllerFactory for DataSetFactory {
    fn step_type(&self) -> &str {
        "dataset"
    }

    async fn prepare(&self, spec: &StepSpec, _exec: &ExecutionContext) -> Result<Value, StepError> {
        if spec.config.is_null() {
            return Ok(Value::Null);
        }
        let config: DataSetConfig = serde_json::from_value(spec.config.clone())
            .map_err(|e| StepError::system(format!("步骤 {} 配置无效: {}", spec.id, e)))?;
        let Some(file) = config.file else {
            return Ok(Value::Null);
        };
        if file.contains('\n') {
            return Ok(Value::String(file));
        }
        debug!("读取数据集文件: {}", file);
        let content = tokio::fs::read_to_string(&file)
            .await
            .map_err(|e| StepError::system(format!("读取数据集文件 {} 失败: {}", file, e)))?;
        Ok(Value::String(content))
    }

    fn create(&self, _spec: &StepSpec, prepared: Value) -> Box<dyn Controller> {
        Box::new(DataSetStep {
            csv: prepared.as_str().map(str::to_string),
            ..Default::default()
        })
    }

    fn create_init_result(
        &self,
        mut base: steprun_common::ResultNode,
        _spec: &StepSpec,
    ) -> steprun_common::ResultNode {
        base.children = Some(steprun_common::ChildResults::Groups(Vec::new()));
        base
    }
}

#[derive(Default)]
pub struct DataSetStep {
    config: DataSetConfig,
    csv: Option<String>,
    rows: Vec<Map<String, Value>>,
    completed: usize,
    failed: Vec<usize>,
}

impl DataSetStep {
    async fn resolve_rows(&self, step: &StepRuntime<'_>) -> Result<Vec<Map<String, Value>>, StepError> {
        let fields = &self.config.fields;

        let csv_table = if fields.iter().any(|f| f.mode == FieldMode::Csv) {
            let content = self
                .csv
                .as_deref()
                .ok_or_else(|| StepError::system("数据集缺少 CSV 文件"))?;
            Some(parse_csv(content)?)
        } else {
            None
        };

        let source_rows = if fields.iter().any(|f| f.mode == FieldMode::Datasource) {
            let query = self
                .config
                .data_source
                .as_ref()
                .ok_or_else(|| StepError::system("数据集缺少 dataSource 配置"))?;
            Some(query_data_source(step, query).await?)
        } else {
            None
        };

        let mut columns: Vec<Option<Vec<Value>>> = Vec::with_capacity(fields.len());
        for field in fields {
            let column = match field.mode {
                FieldMode::Static => Some(
                    field
                        .values
                        .iter()
                        .map(|v| step.scope.render_value(v))
                        .collect(),
                ),
                FieldMode::Csv => {
                    let table = csv_table.as_ref().ok_or_else(|| StepError::system("数据集缺少 CSV 文件"))?;
                    Some(table.get(field.column()).cloned().ok_or_else(|| {
                        StepError::system(format!("CSV 中不存在列 {}", field.column()))
                    })?)
                }
                FieldMode::Datasource => Some(
                    source_rows
                        .iter()
                        .flatten()
                        .map(|row| row.get(field.column()).cloned().unwrap_or(Value::Null))
                        .collect(),
                ),
                FieldMode::Mock => None,
            };
            columns.push(column);
        }

        let longest = columns.iter().flatten().map(Vec::len).max();
        let has_mock = fields.iter().any(|f| f.mode == FieldMode::Mock);
        let row_count = match longest {
            Some(len) => len,
            None if has_mock => self.config.count.unwrap_or(1),
            None => self.config.count.unwrap_or(0),
        };

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut rows = Vec::with_capacity(row_count);
        for r in 0..row_count {
            let mut row = Map::new();
            for (field, column) in fields.iter().zip(&columns) {
                let value = match (column, &field.generator) {
                    (Some(column), _) => column.get(r).cloned().unwrap_or(Value::Null),
                    (None, Some(generator)) => generator.generate(&mut rng, r),
                    (None, None) => Value::Null,
                };
                row.insert(field.name.clone(), value);
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

#[async_trait]
impl Controller for DataSetStep {
    async fn before_execute(&mut self, step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        self.config = step.config()?;
        if let Some(field) = self
            .config
            .fields
            .iter()
            .find(|f| f.mode == FieldMode::Mock && f.generator.is_none())
        {
            return Err(StepError::system(format!("Mock 字段 {} 缺少 generator", field.name)));
        }
        Ok(())
    }

    async fn execute(&mut self, step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        self.rows = self.resolve_rows(step).await?;
        info!("数据集 {} 共 {} 行", step.spec.id, self.rows.len());

        let spec = step.spec;
        let steps = spec.child_groups().first().copied().unwrap_or(&[]);
        if self.rows.is_empty() || steps.is_empty() {
            step.skip();
            return Ok(());
        }

        let plan = IterationPlan {
            count: self.rows.len(),
            degree: self.config.degree.unwrap_or(1).max(1),
            ignore_error: self.config.ignore_error,
            index_name: self
                .config
                .index_name
                .clone()
                .unwrap_or_else(|| DEFAULT_INDEX_NAME.to_string()),
            interval: Duration::from_millis(self.config.interval),
            continue_on_error: self.config.continue_on_error,
        };
        let outcome = iterate(step, steps, &plan, &self.rows).await;
        self.completed = outcome.completed;
        self.failed = outcome.failed.clone();
        match outcome.error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn extra_result(&self) -> Value {
        json!({
            "rows": self.rows.len(),
            "completed": self.completed,
            "failed": self.failed,
        })
    }

    fn detail_result(&self) -> Value {
        json!({ "rows": self.rows })
    }
}

/// 按列解析 CSV (首行为表头)
fn parse_csv(content: &str) -> Result<HashMap<String, Vec<Value>>, StepError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| StepError::system(format!("CSV 表头解析失败: {}", e)))?
        .clone();

    let mut table: HashMap<String, Vec<Value>> = headers
        .iter()
        .map(|h| (h.to_string(), Vec::new()))
        .collect();
    for (line, record) in reader.records().enumerate() {
        let record =
            record.map_err(|e| StepError::system(format!("CSV 第 {} 行解析失败: {}", line + 2, e)))?;
        for (header, value) in headers.iter().zip(record.iter()) {
            if let Some(column) = table.get_mut(header) {
                column.push(Value::String(value.to_string()));
            }
        }
    }
    Ok(table)
}

async fn query_data_source(
    step: &StepRuntime<'_>,
    query: &DataSourceQuery,
) -> Result<Vec<Value>, StepError> {
    let source = step
        .exec
        .env
        .data_sources
        .get(&query.id)
        .ok_or_else(|| StepError::system(format!("数据源 {} 未定义", query.id)))?;
    let command = step.scope.render(&query.query);
    debug!("数据集查询数据源 {} ({}): {}", query.id, source.source_type, command);
    step.exec
        .services
        .data_sources
        .execute(&source.source_type, &source.config, &command)
        .await
        .map_err(StepError::wrap_execute)
}
