//! Plain-text rendering for CLI output.

use std::fmt::Write;

use crate::models::*;

const PLANNED: char = '○';
const ACTIVE: char = '◐';
const DONE: char = '●';
const BLOCKED: char = '✗';

fn stage_symbol(stage: Stage) -> char {
    match stage {
        Stage::Planning => PLANNED,
        Stage::InProgress | Stage::Implementation | Stage::Testing | Stage::Review => ACTIVE,
        Stage::Completed => DONE,
        Stage::Blocked => BLOCKED,
    }
}

/// Render an epic, its features and their current-stage tasks as a tree.
///
/// ```text
/// Payments Refactor (medium, active)
/// ├── ◐ Payments Refactor: Foundation [in_progress]
/// │   ├── [x] Write a short design note for Payments Refactor: Foundation
/// │   └── [ ] Review the design
/// └── ○ Payments Refactor: Core logic [planning]
/// ```
pub fn render_epic_tree(detail: &EpicDetail, tasks: &[Task]) -> String {
    let epic = &detail.epic;
    let mut output = format!("{} ({}, {})\n", epic.name, epic.complexity, epic.status);

    for (i, feature) in detail.features.iter().enumerate() {
        let is_last = i == detail.features.len() - 1;
        let branch = if is_last { "└── " } else { "├── " };
        let _ = writeln!(
            output,
            "{branch}{} {} [{}]",
            stage_symbol(feature.stage),
            feature.name,
            feature.stage
        );

        let children: Vec<&Task> = tasks.iter().filter(|t| t.feature_id == feature.id).collect();
        let child_prefix = if is_last { "    " } else { "│   " };
        for (j, task) in children.iter().enumerate() {
            let branch = if j == children.len() - 1 { "└── " } else { "├── " };
            let mark = if task.completed { "[x]" } else { "[ ]" };
            let _ = writeln!(output, "{child_prefix}{branch}{mark} {}", task.description);
        }
    }
    output
}

pub fn render_epic_list(epics: &[Epic]) -> String {
    if epics.is_empty() {
        return "no epics\n".to_string();
    }
    let mut output = String::new();
    for epic in epics {
        let _ = writeln!(
            output,
            "{}  {:<9} {:<6} {:>2} features  {}",
            epic.id,
            epic.status,
            epic.complexity,
            epic.feature_ids.len(),
            epic.name
        );
    }
    output
}

pub fn render_features(features: &[Feature]) -> String {
    if features.is_empty() {
        return "no features\n".to_string();
    }
    let mut output = String::new();
    for f in features {
        let assignee = f.assigned_to.as_deref().unwrap_or("-");
        let _ = writeln!(
            output,
            "{} {}  {:<14} {:<6} {:<10} {}",
            stage_symbol(f.stage),
            f.id,
            f.stage,
            f.priority,
            assignee,
            f.name
        );
    }
    output
}

pub fn render_feature(feature: &Feature) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "{} {}", stage_symbol(feature.stage), feature.name);
    let _ = writeln!(output, "  id:        {}", feature.id);
    let _ = writeln!(output, "  epic:      {}", feature.epic_id);
    let _ = writeln!(output, "  stage:     {}", feature.stage);
    let _ = writeln!(output, "  priority:  {}", feature.priority);
    let _ = writeln!(output, "  effort:    {}", feature.effort);
    let _ = writeln!(output, "  assignee:  {}", feature.assigned_to.as_deref().unwrap_or("-"));
    let _ = writeln!(output, "  branch:    {}", feature.branch_name());
    let _ = writeln!(output, "  version:   {}", feature.version);
    if !feature.acceptance_criteria.is_empty() {
        let _ = writeln!(output, "  accept:    {}", feature.acceptance_criteria);
    }
    output
}

pub fn render_tasks(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return "no tasks\n".to_string();
    }
    let mut output = String::new();
    for task in tasks {
        let mark = if task.completed { "[x]" } else { "[ ]" };
        let _ = writeln!(
            output,
            "{mark} {}  {:<14} {}  {}",
            task.id, task.stage, task.feature_id, task.description
        );
    }
    output
}

pub fn render_events(events: &[LifecycleEvent]) -> String {
    if events.is_empty() {
        return "no events\n".to_string();
    }
    let mut output = String::new();
    for event in events {
        let from_to = match (event.metadata.get("from"), event.metadata.get("to")) {
            (Some(from), Some(to)) => format!(
                "{} -> {}",
                from.as_str().unwrap_or("?"),
                to.as_str().unwrap_or("?")
            ),
            _ => String::new(),
        };
        let _ = write!(
            output,
            "#{:<5} {}  {:<9} {:<9} {}",
            event.seq,
            format_timestamp(&event.created_at),
            event.action,
            event.outcome,
            from_to
        );
        if let Some(error) = event.metadata.get("error").and_then(|e| e.as_str()) {
            let _ = write!(output, "  ({error})");
        }
        output.push('\n');
    }
    output
}

/// Render an orchestration plan as a report.
pub fn render_plan(plan: &OrchestrationPlan) -> String {
    let mut output = String::new();
    let _ = writeln!(
        output,
        "plan {} ({} mode, capacity {}, {} active before, {} after, {} free)",
        plan.id, plan.mode, plan.capacity, plan.active_before, plan.active_after, plan.available
    );
    if plan.incomplete {
        output.push_str("INCOMPLETE: some registry queries failed\n");
    }
    if plan.cancelled {
        output.push_str("CANCELLED: remaining decisions were not dispatched\n");
    }
    for warning in &plan.warnings {
        let _ = writeln!(output, "warning: {warning}");
    }

    if plan.decisions.is_empty() {
        output.push_str("nothing to do\n");
        return output;
    }

    for d in &plan.decisions {
        let action = d.action.map(|a| a.as_str()).unwrap_or("-");
        let _ = write!(
            output,
            "{:<8} {:<8} {:<9} {} [{}] {}: {}",
            d.kind, action, d.status, d.feature_id, d.stage, d.feature_name, d.rationale
        );
        if let Some(error) = &d.error {
            let _ = write!(output, " (error: {error})");
        }
        output.push('\n');
    }
    output
}

pub fn render_plan_list(plans: &[OrchestrationPlan]) -> String {
    if plans.is_empty() {
        return "no plans\n".to_string();
    }
    let mut output = String::new();
    for plan in plans {
        let executed = plan
            .decisions
            .iter()
            .filter(|d| d.status == DecisionStatus::Executed)
            .count();
        let _ = writeln!(
            output,
            "{}  {}  {:<11} {} decisions, {} executed{}",
            plan.id,
            format_timestamp(&plan.created_at),
            plan.mode,
            plan.decisions.len(),
            executed,
            if plan.incomplete { " (incomplete)" } else { "" }
        );
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn feature(id: &str, name: &str, stage: Stage) -> Feature {
        Feature {
            id: id.into(),
            epic_id: "epic_1".into(),
            position: 0,
            name: name.into(),
            description: String::new(),
            priority: Priority::High,
            effort: Effort::Small,
            stage,
            assigned_to: None,
            acceptance_criteria: String::new(),
            files: Vec::new(),
            dependencies: Vec::new(),
            checklist: Vec::new(),
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn detail(features: Vec<Feature>) -> EpicDetail {
        EpicDetail {
            epic: Epic {
                id: "epic_1".into(),
                name: "Payments".into(),
                description: String::new(),
                complexity: Complexity::Small,
                status: EpicStatus::Active,
                feature_ids: features.iter().map(|f| f.id.clone()).collect(),
                milestones: Vec::new(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            features,
        }
    }

    #[test]
    fn renders_epic_without_tasks() {
        let d = detail(vec![
            feature("f1", "Core", Stage::InProgress),
            feature("f2", "Docs", Stage::Planning),
        ]);
        assert_eq!(
            render_epic_tree(&d, &[]),
            "Payments (small, active)\n├── ◐ Core [in_progress]\n└── ○ Docs [planning]\n"
        );
    }

    #[test]
    fn renders_tasks_under_their_feature() {
        let d = detail(vec![
            feature("f1", "Core", Stage::InProgress),
            feature("f2", "Docs", Stage::Blocked),
        ]);
        let task = Task {
            id: "task_1".into(),
            feature_id: "f1".into(),
            stage: Stage::InProgress,
            position: 0,
            description: "Design".into(),
            completed: true,
            created_at: Utc::now(),
        };
        assert_eq!(
            render_epic_tree(&d, &[task]),
            "Payments (small, active)\n├── ◐ Core [in_progress]\n│   └── [x] Design\n└── ✗ Docs [blocked]\n"
        );
    }

    #[test]
    fn empty_plan_says_nothing_to_do() {
        let plan = OrchestrationPlan {
            id: "plan_1".into(),
            mode: OrchestrationMode::Suggest,
            capacity: 2,
            active_before: 0,
            active_after: 0,
            available: 2,
            decisions: Vec::new(),
            warnings: Vec::new(),
            incomplete: true,
            cancelled: false,
            created_at: Utc::now(),
        };
        let output = render_plan(&plan);
        assert!(output.contains("INCOMPLETE"));
        assert!(output.ends_with("nothing to do\n"));
    }
}
