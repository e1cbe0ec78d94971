//! OData system query options.

use std::fmt;

/// Sort direction for `$orderby`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending order.
    Asc,
    /// Descending order.
    Desc,
}

impl Direction {
    /// Returns the keyword used in `$orderby`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        }
    }
}

/// One `$orderby` term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    /// Field or expression to sort by.
    pub field: String,
    /// Sort direction.
    pub direction: Direction,
}

impl OrderBy {
    /// Ascending order on `field`.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    /// Descending order on `field`.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.direction.as_str())
    }
}

/// Name given to the aggregate at position `index` of a pipeline.
pub fn aggregated_name(index: usize) -> String {
    format!("aggregatedProperty{}", index)
}

/// One aggregate expression inside `$apply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    /// Aggregate expression, e.g. `Amount with sum`.
    pub expression: String,
    /// Alias of the computed value.
    pub alias: String,
}

impl Aggregate {
    /// Creates an aggregate with an explicit alias.
    pub fn new(expression: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            alias: alias.into(),
        }
    }

    /// Creates an aggregate aliased by its position in the pipeline.
    pub fn indexed(expression: impl Into<String>, index: usize) -> Self {
        Self::new(expression, aggregated_name(index))
    }
}

/// A `$apply` transformation pipeline: optional filter, grouping and
/// aggregation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyPipeline {
    /// Filter applied before grouping.
    pub filter: Option<String>,
    /// Grouping properties (paths).
    pub group_by: Vec<String>,
    /// Aggregates computed per group.
    pub aggregates: Vec<Aggregate>,
}

impl ApplyPipeline {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pre-grouping filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Adds a grouping property.
    pub fn group_by(mut self, path: impl Into<String>) -> Self {
        self.group_by.push(path.into());
        self
    }

    /// Adds an aggregate.
    pub fn aggregate(mut self, aggregate: Aggregate) -> Self {
        self.aggregates.push(aggregate);
        self
    }

    /// Renders the pipeline, or `None` if it has no steps.
    pub fn render(&self) -> Option<String> {
        let group_by = self.group_by.join(",");
        let aggregate = self
            .aggregates
            .iter()
            .map(|a| format!("{} as {}", a.expression, a.alias))
            .collect::<Vec<_>>()
            .join(",");

        let apply = match (group_by.is_empty(), aggregate.is_empty()) {
            (false, false) => format!("groupby(({}),aggregate({}))", group_by, aggregate),
            (false, true) => format!("groupby(({}))", group_by),
            (true, false) => format!("aggregate({})", aggregate),
            (true, true) => String::new(),
        };

        match (&self.filter, apply.is_empty()) {
            (Some(filter), false) => Some(format!("filter({})/{}", filter, apply)),
            (Some(filter), true) => Some(format!("filter({})", filter)),
            (None, false) => Some(apply),
            (None, true) => None,
        }
    }
}

/// System query options for a GET request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// `$select` list.
    pub select: Option<String>,
    /// `$expand` expression.
    pub expand: Option<String>,
    /// `$filter` expression.
    pub filter: Option<String>,
    /// `$orderby` terms.
    pub order_by: Vec<OrderBy>,
    /// `$top`.
    pub top: Option<u64>,
    /// `$skip`.
    pub skip: Option<u64>,
    /// `$count=true` when set.
    pub count: bool,
    /// `$apply` pipeline.
    pub apply: Option<ApplyPipeline>,
}

impl QueryOptions {
    /// Creates empty query options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `$select`.
    pub fn with_select(mut self, select: impl Into<String>) -> Self {
        self.select = Some(select.into());
        self
    }

    /// Sets `$expand`.
    pub fn with_expand(mut self, expand: impl Into<String>) -> Self {
        self.expand = Some(expand.into());
        self
    }

    /// Sets `$filter`.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Appends an `$orderby` term.
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    /// Sets `$apply`.
    pub fn with_apply(mut self, apply: ApplyPipeline) -> Self {
        self.apply = Some(apply);
        self
    }

    /// Requests page `current_page` (zero based) of `page_size` rows along
    /// with the total count. A zero page size disables paging.
    pub fn paginate(mut self, page_size: u64, current_page: u64) -> Self {
        if page_size == 0 {
            return self;
        }
        self.top = Some(page_size);
        self.skip = Some(page_size * current_page).filter(|skip| *skip > 0);
        self.count = true;
        self
    }

    /// Returns a copy of `self` where every option set in `other` wins.
    pub fn overlay(mut self, other: &QueryOptions) -> Self {
        if other.select.is_some() {
            self.select = other.select.clone();
        }
        if other.expand.is_some() {
            self.expand = other.expand.clone();
        }
        if other.filter.is_some() {
            self.filter = other.filter.clone();
        }
        if !other.order_by.is_empty() {
            self.order_by = other.order_by.clone();
        }
        if other.top.is_some() {
            self.top = other.top;
        }
        if other.skip.is_some() {
            self.skip = other.skip;
        }
        self.count |= other.count;
        if other.apply.is_some() {
            self.apply = other.apply.clone();
        }
        self
    }

    /// Renders the options as query parameters, skipping unset ones.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        let mut push = |name: &str, value: String| params.push((name.to_string(), value));

        if let Some(apply) = self.apply.as_ref().and_then(ApplyPipeline::render) {
            push("$apply", apply);
        }
        if let Some(select) = self.select.as_ref().filter(|s| !s.is_empty()) {
            push("$select", select.clone());
        }
        if let Some(expand) = self.expand.as_ref().filter(|s| !s.is_empty()) {
            push("$expand", expand.clone());
        }
        if let Some(filter) = self.filter.as_ref().filter(|s| !s.is_empty()) {
            push("$filter", filter.clone());
        }
        if !self.order_by.is_empty() {
            let order = self
                .order_by
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            push("$orderby", order);
        }
        if let Some(top) = self.top {
            push("$top", top.to_string());
        }
        if let Some(skip) = self.skip {
            push("$skip", skip.to_string());
        }
        if self.count {
            push("$count", "true".to_string());
        }
        params
    }
}
