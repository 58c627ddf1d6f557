use chrono::{DateTime, Utc};

const REPORT_VERSION: &str = "1.0";

/// First heading of an analysis report, without the leading marker
pub fn report_title(analysis: &str) -> Option<&str> {
    analysis
        .lines()
        .find_map(|line| line.trim().strip_prefix("# "))
        .map(|heading| {
            heading
                .strip_prefix("Concept Analysis: ")
                .unwrap_or(heading)
                .trim()
        })
}

/// Renders the final documents of a concept review
#[derive(Debug, Clone)]
pub struct ConceptReports {
    organisation: String,
}

impl Default for ConceptReports {
    fn default() -> Self {
        Self::new("Conclave")
    }
}

impl ConceptReports {
    pub fn new(organisation: impl Into<String>) -> Self {
        Self {
            organisation: organisation.into(),
        }
    }

    pub fn organisation(&self) -> &str {
        &self.organisation
    }

    /// Development report for an approved concept
    pub fn approved_report(
        &self,
        analysis: &str,
        feedback: Option<&str>,
        decided_at: DateTime<Utc>,
    ) -> String {
        let org = &self.organisation;
        let title = report_title(analysis).unwrap_or("Submitted Concept");
        let notes = feedback
            .map(|f| format!("\n**Additional Notes:** {}\n", f))
            .unwrap_or_default();

        format!(
            "# {org} Concept Analysis Report\n\
             ## Status: APPROVED FOR DEVELOPMENT\n\
             \n\
             **Concept:** {title}\n\
             **Report Generated:** {generated}\n\
             **Analysis Version:** {version}\n\
             \n\
             ---\n\
             \n\
             ## Executive Summary\n\
             \n\
             This concept has been **APPROVED** for development by the {org} review board.\n\
             {notes}\
             \n\
             ---\n\
             \n\
             {analysis}\n\
             \n\
             ---\n\
             \n\
             ## Next Steps for Development\n\
             \n\
             ### Immediate Actions (next 30 days)\n\
             1. **Design Refinement**: technical sketches, final palette and material specifications, size range\n\
             2. **Prototype Development**: source materials, produce first samples, run fit and wear tests\n\
             3. **Market Validation**: focus groups with target customers, competitor review, pricing check\n\
             \n\
             ### Medium-term Goals (60-90 days)\n\
             1. **Production Planning**: select manufacturing partners, set quality standards, plan first quantities\n\
             2. **Marketing Strategy**: positioning, campaign concepts, launch timeline\n\
             \n\
             ### Long-term Vision (6+ months)\n\
             1. **Collection Expansion**: concept extensions, seasonal variations, complementary lines\n\
             \n\
             ---\n\
             \n\
             ## Approval Details\n\
             \n\
             **Decision Date:** {decided}\n\
             **Decision Status:** APPROVED\n\
             **Approved by:** {org} Design Review Board\n",
            version = REPORT_VERSION,
            generated = Utc::now().format("%B %d, %Y at %I:%M %p"),
            decided = decided_at.format("%B %d, %Y"),
        )
    }

    /// Feedback email for a concept that was not selected
    pub fn rejection_draft(
        &self,
        analysis: &str,
        feedback: Option<&str>,
        decided_at: DateTime<Utc>,
    ) -> String {
        let org = &self.organisation;
        let title = report_title(analysis).unwrap_or("Your Concept");
        let reasons = feedback.unwrap_or(
            "After careful evaluation, this concept does not fit our current strategic direction and seasonal planning.",
        );

        format!(
            "# {org} Concept Review - Decision Notification\n\
             \n\
             **Date:** {date}\n\
             **Subject:** Re: Concept Submission - {title}\n\
             \n\
             ---\n\
             \n\
             Dear Concept Designer,\n\
             \n\
             Thank you for submitting your concept to {org}. Our review team evaluated it against our \
             current priorities, market positioning and production capabilities.\n\
             \n\
             ## Review Decision: Not Selected for Development\n\
             \n\
             We have decided not to move forward with this concept at this time. The decision reflects \
             our specific business needs rather than the creativity of your work.\n\
             \n\
             ## Detailed Feedback\n\
             \n\
             ### Areas of Consideration\n\
             {reasons}\n\
             \n\
             ### Strengthening Future Submissions\n\
             - Show clear alignment with the {org} brand aesthetic\n\
             - Include technical specifications and material choices\n\
             - Demonstrate understanding of the target customer and current trends\n\
             - Add production timeline and cost considerations\n\
             \n\
             We welcome future submissions and wish you continued success.\n\
             \n\
             Best regards,\n\
             \n\
             **{org} Design Review Team**\n",
            date = decided_at.format("%B %d, %Y"),
        )
    }
}
