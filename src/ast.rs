//! 过滤树的类型定义
//!
//! 过滤树由解析器从调用方提交的 JSON 构造, 每次查询请求构造一次,
//! 编译完成后即丢弃。

use std::fmt;

/// 节点在过滤树中的位置: 从根开始依次经过的子节点下标
///
/// 根节点为空路径。路径用于生成确定性的表别名和参数名,
/// 以及作为 pushdown 注解的键。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodePath(pub Vec<usize>);

impl NodePath {
    pub fn root() -> Self {
        NodePath(Vec::new())
    }

    pub fn child(&self, index: usize) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        NodePath(indices)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// 用于 SQL 别名和参数名的标识符, 例如 `n_0_1`
    pub fn ident(&self) -> String {
        let mut out = String::from("n");
        for index in &self.0 {
            out.push('_');
            out.push_str(&index.to_string());
        }
        out
    }
}

impl fmt::Display for NodePath {
    /// 以 JSON 路径的形式显示, 例如 `$.values[0].values[1]`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$")?;
        for index in &self.0 {
            write!(f, ".values[{}]", index)?;
        }
        Ok(())
    }
}

/// 过滤树节点
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    /// 逻辑分组, children 保证非空
    Group {
        operator: GroupOperator,
        children: Vec<FilterNode>,
    },
    /// 基于事件流的行为条件
    Behavioral(BehavioralCondition),
    /// 基于用户属性的静态条件
    Person(PersonPropertyCondition),
}

impl FilterNode {
    /// 子树中是否包含行为条件
    pub fn has_behavioral(&self) -> bool {
        match self {
            FilterNode::Group { children, .. } => children.iter().any(FilterNode::has_behavioral),
            FilterNode::Behavioral(_) => true,
            FilterNode::Person(_) => false,
        }
    }

    /// 按树的先序遍历顺序访问所有叶子节点
    pub fn for_each_leaf<'a, F>(&'a self, path: &NodePath, visit: &mut F)
    where
        F: FnMut(&NodePath, &'a FilterNode),
    {
        match self {
            FilterNode::Group { children, .. } => {
                for (index, child) in children.iter().enumerate() {
                    child.for_each_leaf(&path.child(index), visit);
                }
            }
            leaf => visit(path, leaf),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOperator {
    And,
    Or,
}

/// 行为条件: 一个事件或动作 (subject) 加上一种判定方式 (kind)
#[derive(Debug, Clone, PartialEq)]
pub struct BehavioralCondition {
    pub subject: Subject,
    pub kind: BehavioralKind,
}

/// 行为条件所匹配的对象
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    /// 事件名, 例如 `$pageview`
    Event(String),
    /// 动作 id, 展开为该动作的所有匹配规则
    Action(i64),
}

/// 行为条件的判定方式
///
/// 每种方式只携带它需要的字段, 因此 "Stopped 需要两个窗口"、
/// "Regularly 需要周期数" 之类的约束由类型本身保证。
#[derive(Debug, Clone, PartialEq)]
pub enum BehavioralKind {
    PerformedEvent {
        window: TimeWindow,
    },
    PerformedEventMultiple {
        window: TimeWindow,
        comparison: Comparison,
    },
    StoppedPerforming {
        window: TimeWindow,
        sequence_window: TimeWindow,
    },
    RestartedPerforming {
        window: TimeWindow,
        sequence_window: TimeWindow,
    },
    PerformedFirstTime {
        window: TimeWindow,
    },
    PerformedSequence {
        window: TimeWindow,
        sequence_window: TimeWindow,
        /// 必须在第一个事件之后出现的第二个事件
        next: Subject,
    },
    PerformedRegularly {
        /// 单个周期的长度
        window: TimeWindow,
        comparison: Comparison,
        total_periods: u32,
        min_periods: u32,
    },
}

impl BehavioralKind {
    pub fn name(&self) -> &'static str {
        match self {
            BehavioralKind::PerformedEvent { .. } => "performed_event",
            BehavioralKind::PerformedEventMultiple { .. } => "performed_event_multiple",
            BehavioralKind::StoppedPerforming { .. } => "stopped_performing_event",
            BehavioralKind::RestartedPerforming { .. } => "restarted_performing_event",
            BehavioralKind::PerformedFirstTime { .. } => "performed_event_first_time",
            BehavioralKind::PerformedSequence { .. } => "performed_event_sequence",
            BehavioralKind::PerformedRegularly { .. } => "performed_event_regularly",
        }
    }
}

/// 时间窗口, 例如 `(2, Week)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub value: i64,
    pub unit: TimeUnit,
}

impl TimeWindow {
    pub fn new(value: i64, unit: TimeUnit) -> Self {
        Self { value, unit }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Day,
    Week,
    Month,
}

impl TimeUnit {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(TimeUnit::Day),
            "week" => Some(TimeUnit::Week),
            "month" => Some(TimeUnit::Month),
            _ => None,
        }
    }
}

/// 事件次数比较, 例如 "至少 2 次"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Comparison {
    pub operator: ComparisonOperator,
    pub value: i64,
}

impl Comparison {
    /// 只有发生过至少一次的计数才参与比较, 因此 `lte n` 表示 `1..=n`
    pub fn satisfied_by(&self, count: i64) -> bool {
        count > 0
            && match self.operator {
                ComparisonOperator::Gte => count >= self.value,
                ComparisonOperator::Lte => count <= self.value,
                ComparisonOperator::Eq => count == self.value,
            }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Gte,
    Lte,
    Eq,
}

impl ComparisonOperator {
    pub fn sql(&self) -> &'static str {
        match self {
            ComparisonOperator::Gte => ">=",
            ComparisonOperator::Lte => "<=",
            ComparisonOperator::Eq => "=",
        }
    }
}

/// 用户属性条件
#[derive(Debug, Clone, PartialEq)]
pub struct PersonPropertyCondition {
    pub key: String,
    pub operator: PropertyOperator,
    pub value: PropertyValue,
}

/// 用户属性比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyOperator {
    Exact,
    IsNot,
    IContains,
    NotIContains,
    Regex,
    NotRegex,
    Gt,
    Gte,
    Lt,
    Lte,
    IsSet,
    IsNotSet,
}

impl PropertyOperator {
    pub fn parse(s: &str) -> Option<Self> {
        let op = match s {
            "exact" => PropertyOperator::Exact,
            "is_not" => PropertyOperator::IsNot,
            "icontains" => PropertyOperator::IContains,
            "not_icontains" => PropertyOperator::NotIContains,
            "regex" => PropertyOperator::Regex,
            "not_regex" => PropertyOperator::NotRegex,
            "gt" => PropertyOperator::Gt,
            "gte" => PropertyOperator::Gte,
            "lt" => PropertyOperator::Lt,
            "lte" => PropertyOperator::Lte,
            "is_set" => PropertyOperator::IsSet,
            "is_not_set" => PropertyOperator::IsNotSet,
            _ => return None,
        };
        Some(op)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            PropertyOperator::Gt | PropertyOperator::Gte | PropertyOperator::Lt | PropertyOperator::Lte
        )
    }
}

/// 属性值。数字和布尔值在比较前统一转成字符串形式
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Text(String),
    List(Vec<String>),
    Number(f64),
    /// `is_set` / `is_not_set` 不需要值
    Empty,
}
