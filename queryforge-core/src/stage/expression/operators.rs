// queryforge-core/src/stage/expression/operators.rs
// Pipeline expression operators and group accumulators

use crate::rules::Rule;
use crate::schema::TypeName;

/// How an operator value is parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    /// Property, literal, variable or nested expression; arrays rejected
    SimpleOrExpression,
    /// Anything, including arrays of expressions
    AnyExpression,
    /// An array whose elements are any expression
    ArrayOfExpressions,
    /// Like `SimpleOrExpression`, with date strings turned into dates
    DateOrSimpleOrExpression,
    /// Typed literal; built under `$literal`
    Literal,
    /// `[format, date, timezone?]`
    DateToString,
    /// `$expand` arguments
    Expand,
}

macro_rules! pipeline_ops {
    ($($variant:ident => $key:literal),+ $(,)?) => {
        /// Operators of `$project`/`$addFields` expressions, also used inside
        /// `$group` keys and accumulators
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum PipelineOp {
            $($variant),+
        }

        impl PipelineOp {
            pub fn lookup(key: &str) -> Option<Self> {
                match key {
                    $($key => Some(PipelineOp::$variant),)+
                    _ => None,
                }
            }

            pub fn key(&self) -> &'static str {
                match self {
                    $(PipelineOp::$variant => $key),+
                }
            }
        }
    };
}

pipeline_ops! {
    Sum => "$sum",
    Avg => "$avg",
    Max => "$max",
    Min => "$min",
    StdDevPop => "$stdDevPop",
    StdDevSamp => "$stdDevSamp",
    Literal => "$literal",
    String => "$string",
    Number => "$number",
    Integer => "$integer",
    Boolean => "$boolean",
    Date => "$date",
    ObjectId => "$objectId",
    Array => "$array",
    Object => "$object",
    And => "$and",
    Or => "$or",
    Not => "$not",
    SetEquals => "$setEquals",
    SetIntersection => "$setIntersection",
    SetUnion => "$setUnion",
    SetDifference => "$setDifference",
    SetIsSubset => "$setIsSubset",
    AnyElementTrue => "$anyElementTrue",
    AllElementsTrue => "$allElementsTrue",
    Cmp => "$cmp",
    Eq => "$eq",
    Gt => "$gt",
    Gte => "$gte",
    Lt => "$lt",
    Lte => "$lte",
    Ne => "$ne",
    Cond => "$cond",
    IfNull => "$ifNull",
    Trunc => "$trunc",
    Sqrt => "$sqrt",
    Ln => "$ln",
    Floor => "$floor",
    Exp => "$exp",
    Ceil => "$ceil",
    Abs => "$abs",
    Add => "$add",
    Multiply => "$multiply",
    Subtract => "$subtract",
    Divide => "$divide",
    Mod => "$mod",
    Pow => "$pow",
    Log => "$log",
    Concat => "$concat",
    Substr => "$substr",
    ToLower => "$toLower",
    ToUpper => "$toUpper",
    Strcasecmp => "$strcasecmp",
    Size => "$size",
    Slice => "$slice",
    IsArray => "$isArray",
    ConcatArrays => "$concatArrays",
    ArrayElemAt => "$arrayElemAt",
    DayOfYear => "$dayOfYear",
    DayOfMonth => "$dayOfMonth",
    DayOfWeek => "$dayOfWeek",
    Year => "$year",
    Month => "$month",
    Week => "$week",
    Hour => "$hour",
    Minute => "$minute",
    Second => "$second",
    Millisecond => "$millisecond",
    DateToString => "$dateToString",
    Expand => "$expand",
}

impl PipelineOp {
    pub fn template(&self) -> Template {
        use PipelineOp::*;
        match self {
            Sum | Avg | Max | Min | StdDevPop | StdDevSamp | Cond | IfNull => Template::AnyExpression,
            Literal | String | Number | Integer | Boolean | Date | ObjectId | Array | Object => Template::Literal,
            Trunc | Sqrt | Ln | Floor | Exp | Ceil | Abs | ToLower | ToUpper | Size => Template::SimpleOrExpression,
            DayOfYear | DayOfMonth | DayOfWeek | Year | Month | Week | Hour | Minute | Second | Millisecond => {
                Template::DateOrSimpleOrExpression
            }
            DateToString => Template::DateToString,
            Expand => Template::Expand,
            _ => Template::ArrayOfExpressions,
        }
    }

    pub fn rules(&self) -> &'static [Rule] {
        use PipelineOp::*;
        match self {
            Sum | Avg | Max | Min | StdDevPop | StdDevSamp => &[Rule::ValueMustBePropertyPathIfString],
            And | Or | SetIntersection | SetUnion | AnyElementTrue | AllElementsTrue | Concat | ConcatArrays => {
                &[Rule::MustBeArray]
            }
            Not | IsArray => &[Rule::ArrayOfSize(1)],
            SetEquals | Add | Multiply => &[Rule::ArrayOfAtLeastSize(2)],
            SetDifference | SetIsSubset | Cmp | Eq | Gt | Gte | Lt | Lte | Ne | IfNull | Subtract | Divide | Mod
            | Pow | Log | Strcasecmp | ArrayElemAt => &[Rule::ArrayOfSize(2)],
            Cond | Substr => &[Rule::ArrayOfSize(3)],
            Slice | DateToString => &[Rule::ArrayOfLengthBetween(2, 3)],
            _ => &[],
        }
    }

    /// Single values are wrapped into a one element array before the rules run
    pub fn wraps_single_value(&self) -> bool {
        matches!(
            self,
            PipelineOp::Not | PipelineOp::AnyElementTrue | PipelineOp::AllElementsTrue | PipelineOp::IsArray
        )
    }

    pub fn is_date_part(&self) -> bool {
        self.template() == Template::DateOrSimpleOrExpression
    }

    /// Output type of the `$number`-style typed literals
    pub fn literal_type(&self) -> Option<TypeName> {
        match self {
            PipelineOp::String => Some(TypeName::String),
            PipelineOp::Number | PipelineOp::Integer => Some(TypeName::Number),
            PipelineOp::Boolean => Some(TypeName::Boolean),
            PipelineOp::Date => Some(TypeName::Date),
            PipelineOp::ObjectId => Some(TypeName::ObjectId),
            _ => None,
        }
    }
}

/// Top-level `$group` accumulators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Accumulator {
    Count,
    Sum,
    Avg,
    First,
    Last,
    Min,
    Max,
    PushAll,
    Push,
    AddToSet,
    StdDevPop,
    StdDevSamp,
}

/// How an accumulator types its output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorOutput {
    /// A plain number, disconnected from the source
    Number,
    /// Whatever the source is
    Source,
    /// An array of the secured source values
    ArrayOfSource,
}

impl Accumulator {
    pub fn lookup(key: &str) -> Option<Self> {
        match key {
            "$count" => Some(Accumulator::Count),
            "$sum" => Some(Accumulator::Sum),
            "$avg" => Some(Accumulator::Avg),
            "$first" => Some(Accumulator::First),
            "$last" => Some(Accumulator::Last),
            "$min" => Some(Accumulator::Min),
            "$max" => Some(Accumulator::Max),
            "$pushAll" => Some(Accumulator::PushAll),
            "$push" => Some(Accumulator::Push),
            "$addToSet" => Some(Accumulator::AddToSet),
            "$stdDevPop" => Some(Accumulator::StdDevPop),
            "$stdDevSamp" => Some(Accumulator::StdDevSamp),
            _ => None,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            Accumulator::Count => "$count",
            Accumulator::Sum => "$sum",
            Accumulator::Avg => "$avg",
            Accumulator::First => "$first",
            Accumulator::Last => "$last",
            Accumulator::Min => "$min",
            Accumulator::Max => "$max",
            Accumulator::PushAll => "$pushAll",
            Accumulator::Push => "$push",
            Accumulator::AddToSet => "$addToSet",
            Accumulator::StdDevPop => "$stdDevPop",
            Accumulator::StdDevSamp => "$stdDevSamp",
        }
    }

    pub fn rules(&self) -> &'static [Rule] {
        match self {
            Accumulator::Count => &[Rule::ValueMustBePropertyPath],
            _ => &[Rule::ValueMustBePropertyPathIfString],
        }
    }

    pub fn output(&self) -> AccumulatorOutput {
        match self {
            Accumulator::First | Accumulator::Last | Accumulator::Min | Accumulator::Max => {
                AccumulatorOutput::Source
            }
            Accumulator::PushAll | Accumulator::Push | Accumulator::AddToSet => AccumulatorOutput::ArrayOfSource,
            _ => AccumulatorOutput::Number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_lookup_round_trips() {
        for key in ["$sum", "$literal", "$setIsSubset", "$dateToString", "$expand", "$arrayElemAt"] {
            assert_eq!(PipelineOp::lookup(key).unwrap().key(), key);
        }
        assert!(PipelineOp::lookup("$map").is_none());
        assert!(PipelineOp::lookup("$count").is_none());
    }

    #[test]
    fn test_templates() {
        assert_eq!(PipelineOp::Year.template(), Template::DateOrSimpleOrExpression);
        assert!(PipelineOp::Year.is_date_part());
        assert_eq!(PipelineOp::Eq.template(), Template::ArrayOfExpressions);
        assert_eq!(PipelineOp::Cond.template(), Template::AnyExpression);
        assert_eq!(PipelineOp::Integer.template(), Template::Literal);
        assert_eq!(PipelineOp::Integer.literal_type(), Some(TypeName::Number));
        assert!(PipelineOp::Not.wraps_single_value());
    }

    #[test]
    fn test_accumulators() {
        assert_eq!(Accumulator::lookup("$count"), Some(Accumulator::Count));
        assert_eq!(Accumulator::Count.rules(), &[Rule::ValueMustBePropertyPath]);
        assert_eq!(Accumulator::Push.output(), AccumulatorOutput::ArrayOfSource);
        assert_eq!(Accumulator::Sum.output(), AccumulatorOutput::Number);
        assert!(Accumulator::lookup("$literal").is_none());
    }
}
