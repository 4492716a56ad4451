// Evaluation prompt templates.
// Placeholders are `{name}` tokens filled once by prompt_builder::render_template;
// literal braces only ever arrive through substituted values.

/// CV against job requirements. Scores technical_skill and experience.
pub const CV_GAP_ANALYSIS_TEMPLATE: &str = r#"{data_boundary}

Assess how well the candidate's CV covers the job requirements. Identify skill gaps
and relevant experience.

<<<BEGIN JOB REQUIREMENTS>>>
{job_requirements}
<<<END JOB REQUIREMENTS>>>

<<<BEGIN CV>>>
{cv_text}
<<<END CV>>>

CRITERIA TO SCORE: {criteria_list}

{scoring_instruction}

RESPONSE FORMAT: return a JSON object with this EXACT shape (no extra fields):
{schema}"#;

/// Interview transcript against job requirements.
/// Scores technical_skill, communication and cultural_fit.
pub const INTERVIEW_SCORING_TEMPLATE: &str = r#"{data_boundary}

You are an expert interviewer. Assess the candidate's answers for technical accuracy,
clarity of communication, and alignment with the team described in the job requirements.

<<<BEGIN JOB REQUIREMENTS>>>
{job_requirements}
<<<END JOB REQUIREMENTS>>>

<<<BEGIN TRANSCRIPT>>>
{transcript}
<<<END TRANSCRIPT>>>

CRITERIA TO SCORE: {criteria_list}

{scoring_instruction}

RESPONSE FORMAT: return a JSON object with this EXACT shape (no extra fields):
{schema}"#;

/// CV, job requirements and interview transcript together. Scores all criteria.
pub const COMPLETE_EVALUATION_TEMPLATE: &str = r#"{data_boundary}

Produce a complete candidate evaluation from the CV and the interview transcript,
measured against the job requirements.

<<<BEGIN JOB REQUIREMENTS>>>
{job_requirements}
<<<END JOB REQUIREMENTS>>>

<<<BEGIN CV>>>
{cv_text}
<<<END CV>>>

<<<BEGIN TRANSCRIPT>>>
{transcript}
<<<END TRANSCRIPT>>>

CRITERIA TO SCORE: {criteria_list}

{scoring_instruction}

RESPONSE FORMAT: return a JSON object with this EXACT shape (no extra fields):
{schema}"#;

/// Appended on a re-request after the previous reply could not be parsed.
pub const STRICT_REPROMPT_TEMPLATE: &str = r#"IMPORTANT: your previous reply could not be used.
The following fields were missing or invalid: {missing_fields}.
Reply with ONLY the JSON object described above. Every listed criterion MUST have a
numeric "score" between 0 and 100 and a non-empty "rationale". No prose, no code fences."#;
