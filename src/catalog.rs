//! 目录模块: 物化列注册表、动作定义查询以及物理表名映射
//!
//! 编译器不直接访问任何全局状态, 这些信息全部通过
//! [`MaterializedColumns`] 和 [`ActionLookup`] 两个能力对象显式传入。
//! [`CatalogConfig`] 是从 JSON 文件加载的默认实现。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{CohortError, Result};

/// 属性所属的实体
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Events,
    Person,
}

/// 物化列注册表: `(实体, 属性键)` → 物理列名
pub trait MaterializedColumns {
    /// 返回 `None` 表示未物化, 需要从 JSON 属性中提取
    fn materialized_column(&self, entity: EntityKind, key: &str) -> Option<String>;
}

/// 动作定义查询: 动作 id → 有序的匹配规则
pub trait ActionLookup {
    /// 返回 `None` 表示该团队没有这个动作
    fn action_steps(&self, action_id: i64) -> Option<Vec<ActionStep>>;
}

/// 动作的一条匹配规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStep {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub url_matching: UrlMatching,
}

impl ActionStep {
    pub fn event(event: &str) -> Self {
        Self {
            event: Some(event.to_string()),
            url: None,
            url_matching: UrlMatching::default(),
        }
    }

    pub fn with_url(mut self, url: &str, matching: UrlMatching) -> Self {
        self.url = Some(url.to_string());
        self.url_matching = matching;
        self
    }
}

/// URL 匹配方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlMatching {
    Exact,
    #[default]
    Contains,
    Regex,
}

/// 物理表名映射
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableMapping {
    pub events: String,
    pub person: String,
    pub person_distinct_id: String,
}

impl Default for TableMapping {
    fn default() -> Self {
        Self {
            events: "events".to_string(),
            person: "person".to_string(),
            person_distinct_id: "person_distinct_id2".to_string(),
        }
    }
}

/// 按实体分组的物化列
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterializedColumnConfig {
    pub events: BTreeMap<String, String>,
    pub person: BTreeMap<String, String>,
}

/// 目录配置, 对应一个团队的物化列和动作定义
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub tables: TableMapping,
    pub materialized_columns: MaterializedColumnConfig,
    pub actions: BTreeMap<i64, Vec<ActionStep>>,
}

impl CatalogConfig {
    /// 从 JSON 文件加载目录配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        if !path_ref.exists() {
            return Err(CohortError::Config(format!(
                "catalog file does not exist: {}",
                path_ref.display()
            )));
        }

        let content = fs::read_to_string(path_ref).map_err(|e| {
            CohortError::Config(format!("cannot read catalog file {}: {}", path_ref.display(), e))
        })?;

        Self::from_json_str(&content).map_err(|e| {
            CohortError::Config(format!("cannot parse catalog file {}: {}", path_ref.display(), e))
        })
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// 物化一个属性, 返回物理列名。事件列以 `mat_` 开头, 用户列以 `pmat_` 开头
    pub fn materialize(&mut self, entity: EntityKind, key: &str) -> String {
        let (columns, prefix) = match entity {
            EntityKind::Events => (&mut self.materialized_columns.events, "mat_"),
            EntityKind::Person => (&mut self.materialized_columns.person, "pmat_"),
        };
        columns
            .entry(key.to_string())
            .or_insert_with(|| format!("{}{}", prefix, key))
            .clone()
    }

    pub fn add_action(&mut self, action_id: i64, steps: Vec<ActionStep>) {
        self.actions.insert(action_id, steps);
    }
}

impl MaterializedColumns for CatalogConfig {
    fn materialized_column(&self, entity: EntityKind, key: &str) -> Option<String> {
        let columns = match entity {
            EntityKind::Events => &self.materialized_columns.events,
            EntityKind::Person => &self.materialized_columns.person,
        };
        columns.get(key).cloned()
    }
}

impl ActionLookup for CatalogConfig {
    fn action_steps(&self, action_id: i64) -> Option<Vec<ActionStep>> {
        self.actions.get(&action_id).cloned()
    }
}
