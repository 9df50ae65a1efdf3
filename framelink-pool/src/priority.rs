use std::fmt;

/// Scheduling class of a [`crate::Job`]. Each class is an independent FIFO
/// queue inside the pool; workers drain the classes they were configured with
/// in configuration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobPriority {
    /// Urgent, short jobs. By convention: framed socket writes.
    Top,
    High,
    Normal,
    Low,
    /// Jobs that may never return on their own (driver loops).
    LongTerm,
}

impl JobPriority {
    /// All classes, in descending urgency.
    pub const ALL: [JobPriority; 5] = [
        JobPriority::Top,
        JobPriority::High,
        JobPriority::Normal,
        JobPriority::Low,
        JobPriority::LongTerm,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            JobPriority::Top => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
            JobPriority::LongTerm => 4,
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobPriority::Top => "Top",
            JobPriority::High => "High",
            JobPriority::Normal => "Normal",
            JobPriority::Low => "Low",
            JobPriority::LongTerm => "LongTerm",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_are_ordered_by_urgency() {
        assert!(JobPriority::Top < JobPriority::High);
        assert!(JobPriority::High < JobPriority::Normal);
        assert!(JobPriority::Normal < JobPriority::Low);
        assert!(JobPriority::Low < JobPriority::LongTerm);
    }

    #[test]
    fn display_names() {
        let names: Vec<String> = JobPriority::ALL.iter().map(|p| p.to_string()).collect();
        assert_eq!(names, ["Top", "High", "Normal", "Low", "LongTerm"]);
    }
}
