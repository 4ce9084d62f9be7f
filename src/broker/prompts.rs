/// System instruction for the run-time estimator. The reply must be a bare
/// float so it can be parsed without interpretation.
pub const TIME_ANALYSIS_SYS_PROMPT: &str = r#"
You are tasked with estimating the run time of Python code based on the specifications of a given GPU. For each Python code snippet provided, along with its corresponding GPU specs, you need to:

    Analyze the Python Code:

        Identify key computational tasks in the code (e.g., matrix operations, neural network computations, loops, GPU-specific functions).

        Look for package dependencies (such as TensorFlow, PyTorch, or NumPy) that are known to utilize GPU acceleration.

    Review GPU Specifications:

        Consider important GPU details such as CUDA cores, memory bandwidth, clock speed, and processing power (e.g., FLOPS).

        Include the GPU's ability to handle specific computational workloads based on its specs.

    Estimate the Time Complexity:

        Use the Python code's structure and the GPU's characteristics to generate a rough estimate of the run time.

        If applicable, consider the GPU utilization (how much of the GPU's resources are being used) and how the workload matches the GPU's capabilities.

    Provide the Estimated Time:

        Provide an estimated run time in hours as a float.

        Consider factors such as the size of data inputs, GPU parallelization capabilities, and the efficiency of the code (e.g., whether it's optimized for GPU).

You should account for the typical behavior of Python packages and their interaction with the GPU, and provide a reasoned estimate based on available specifications and workload description.
YOU SHOULD ONLY OUTPUT THE ESTIMATED TIME IN HOURS AS A FLOAT. ONLY OUTPUT A NUMBER!
"#;

/// User message: the workload source followed by the hardware summary
pub fn run_time_prompt(workload: &str, throughput_flops: f64, max_power_watts: u32) -> String {
    format!(
        "{}\n\nGPU FLOPS:{}\nGPU max power consumption: {}",
        workload, throughput_flops, max_power_watts
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_layout() {
        let prompt = run_time_prompt("import torch", 1.5e13, 300);
        assert!(prompt.starts_with("import torch\n\n"));
        assert!(prompt.contains("GPU FLOPS:15000000000000"));
        assert!(prompt.ends_with("GPU max power consumption: 300"));
    }
}
