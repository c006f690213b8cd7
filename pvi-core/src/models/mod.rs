mod logistic;

pub use logistic::{LogisticRegression, MulticlassLogisticRegression};
