use crate::result::{AnalysisResult, IngredientCategory, SuitabilityStatus};

fn status_label(status: SuitabilityStatus) -> &'static str {
    match status {
        SuitabilityStatus::Safe => "Suitable for young children",
        SuitabilityStatus::Moderate => "Fine in moderation",
        SuitabilityStatus::Avoid => "Better avoided for young children",
    }
}

fn category_heading(category: IngredientCategory) -> &'static str {
    match category {
        IngredientCategory::Healthy => "Healthy",
        IngredientCategory::Neutral => "Neutral",
        IngredientCategory::Caution => "Use caution",
        IngredientCategory::Unhealthy => "Unhealthy",
    }
}

/// Markdown report for one analysis result.
pub fn render_markdown(result: &AnalysisResult) -> String {
    let verdict = &result.child_suitability;
    let mut lines = vec![
        format!("# {}", result.product_name),
        String::new(),
        result.summary.clone(),
        String::new(),
        "## Child suitability (ages 1-6)".to_string(),
        format!("- Verdict: {} ({})", verdict.status.as_str(), status_label(verdict.status)),
        format!("- Reason: {}", verdict.reason),
    ];
    if let Some(score) = result.health_score {
        lines.push(format!("- Health score: {score}/100"));
    }

    lines.push(String::new());
    lines.push(format!("## Ingredients ({})", result.ingredients.len()));
    if result.ingredients.is_empty() {
        lines.push("No ingredients could be identified.".to_string());
    }
    for category in IngredientCategory::ALL {
        let mut group = result.ingredients_in(category).peekable();
        if group.peek().is_none() {
            continue;
        }
        lines.push(String::new());
        lines.push(format!("### {} ({})", category_heading(category), category.as_str()));
        for ingredient in group {
            let name = if ingredient.name.is_empty() {
                "(unnamed)"
            } else {
                ingredient.name.as_str()
            };
            if ingredient.description.is_empty() {
                lines.push(format!("- **{name}**"));
            } else {
                lines.push(format!("- **{name}**: {}", ingredient.description));
            }
        }
    }

    push_list(&mut lines, "Warnings", &result.warnings);
    push_list(&mut lines, "Pros", &result.pros);

    lines.join("\n") + "\n"
}

fn push_list(lines: &mut Vec<String>, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    lines.push(String::new());
    lines.push(format!("## {title}"));
    for item in items {
        lines.push(format!("- {item}"));
    }
}
